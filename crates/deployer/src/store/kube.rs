//! Object store backed by a Kubernetes API server.

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind as KubeGvk};
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, Error as KubeError};
use tracing::debug;

use async_trait::async_trait;

use super::{namespace_of, ObjectStore, PatchOptions, StoreError, WriteOptions};
use crate::document::{Document, GroupVersionKind};

/// [`ObjectStore`] talking to a remote cluster through `kube`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(&KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind));
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn api_for(&self, document: &Document) -> Api<DynamicObject> {
        self.api(&document.gvk(), namespace_of(document))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Document>, StoreError> {
        let object = self
            .api(gvk, namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, name))?;
        object.map(from_dynamic).transpose()
    }

    async fn create(
        &self,
        document: &Document,
        options: &WriteOptions,
    ) -> Result<Document, StoreError> {
        let params = PostParams {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let created = self
            .api_for(document)
            .create(&params, &to_dynamic(document)?)
            .await
            .map_err(|e| map_error(e, document.name()))?;
        from_dynamic(created)
    }

    async fn update(
        &self,
        document: &Document,
        options: &WriteOptions,
    ) -> Result<Document, StoreError> {
        let params = PostParams {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let replaced = self
            .api_for(document)
            .replace(document.name(), &params, &to_dynamic(document)?)
            .await
            .map_err(|e| map_error(e, document.name()))?;
        from_dynamic(replaced)
    }

    async fn patch(
        &self,
        document: &Document,
        options: &PatchOptions,
    ) -> Result<Document, StoreError> {
        debug!(
            resource = %document.identity(),
            field_manager = %options.field_manager,
            force = options.force,
            dry_run = options.dry_run,
            "Server-side applying resource"
        );
        let patched = self
            .api_for(document)
            .patch(
                document.name(),
                &patch_params(options),
                &Patch::Apply(&to_dynamic(document)?),
            )
            .await
            .map_err(|e| map_error(e, document.name()))?;
        from_dynamic(patched)
    }

    async fn patch_subresource(
        &self,
        document: &Document,
        subresource: &str,
        options: &PatchOptions,
    ) -> Result<Document, StoreError> {
        let patched = self
            .api_for(document)
            .patch_subresource(
                subresource,
                document.name(),
                &patch_params(options),
                &Patch::Apply(&to_dynamic(document)?),
            )
            .await
            .map_err(|e| map_error(e, document.name()))?;
        from_dynamic(patched)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        options: &WriteOptions,
    ) -> Result<(), StoreError> {
        let params = DeleteParams {
            dry_run: options.dry_run,
            ..Default::default()
        };
        self.api(gvk, namespace)
            .delete(name, &params)
            .await
            .map_err(|e| map_error(e, name))?;
        Ok(())
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError> {
        let (_, capabilities) = pinned_kind(
            &self.client,
            &KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind),
        )
        .await
        .map_err(|e| map_error(e, &gvk.kind))?;
        debug!(kind = %gvk.kind, scope = ?capabilities.scope, "Discovered resource scope");
        Ok(matches!(capabilities.scope, Scope::Namespaced))
    }
}

fn patch_params(options: &PatchOptions) -> PatchParams {
    let mut params = PatchParams::apply(&options.field_manager);
    params.force = options.force;
    params.dry_run = options.dry_run;
    params
}

fn to_dynamic(document: &Document) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(document.clone().into_value())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_dynamic(object: DynamicObject) -> Result<Document, StoreError> {
    let value =
        serde_json::to_value(&object).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Document::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn map_error(err: KubeError, name: &str) -> StoreError {
    match err {
        KubeError::Api(response) => match response.code {
            404 if response.message.contains("namespaces \"") => {
                StoreError::NamespaceNotFound(response.message)
            }
            404 => StoreError::NotFound {
                resource: name.to_string(),
            },
            409 if response.reason == "AlreadyExists" => StoreError::AlreadyExists {
                resource: name.to_string(),
            },
            409 => StoreError::Conflict {
                resource: name.to_string(),
                message: response.message,
            },
            code => StoreError::Api {
                code,
                message: response.message,
            },
        },
        KubeError::SerdeError(e) => StoreError::Serialization(e.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}
