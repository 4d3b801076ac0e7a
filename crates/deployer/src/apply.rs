//! # Resource Applier
//!
//! Writes one document into a remote store.
//!
//! Most kinds go through a forced server-side apply. CustomResourceDefinitions
//! are written with a plain get-then-create-or-update instead, because apply
//! semantics for CRDs differ between API server versions. Every write is
//! retried on resource-version conflicts, and dry-run writes never persist.

use tracing::{debug, info, instrument, warn};

use crate::config::DeployerConfig;
use crate::document::Document;
use crate::drift::{apply_patches, transform_drift_exclusions_to_patches, DriftExclusion};
use crate::error::Result;
use crate::probe::crd_gvk;
use crate::retry::RetryPolicy;
use crate::store::{namespace_of, ObjectStore, PatchOptions, StoreError, WriteOptions};

/// Field manager recorded on server-side applies by default
pub const DEFAULT_FIELD_MANAGER: &str = "application/apply-patch";

#[derive(Debug, Clone)]
pub struct ResourceApplier {
    field_manager: String,
    retry: RetryPolicy,
}

impl Default for ResourceApplier {
    fn default() -> Self {
        Self::new(DEFAULT_FIELD_MANAGER)
    }
}

impl ResourceApplier {
    #[must_use]
    pub fn new(field_manager: &str) -> Self {
        Self {
            field_manager: field_manager.to_string(),
            retry: RetryPolicy::on_conflict(),
        }
    }

    #[must_use]
    pub fn from_config(config: &DeployerConfig) -> Self {
        Self {
            field_manager: config.field_manager.clone(),
            retry: RetryPolicy::from_settings(&config.retry),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    /// Create or update `document` and return what the store holds afterwards.
    ///
    /// In drift-detection mode the exclusions are removed from the proposed
    /// document when the resource already exists, so fields managed elsewhere
    /// keep their live values. Listed `subresources` (for example `status`)
    /// are applied afterwards on a best-effort basis.
    ///
    /// A dry-run into a namespace that does not exist yet is reported as a
    /// would-be create and returns the proposed document.
    #[instrument(skip_all, fields(resource = %document.identity(), dry_run = dry_run))]
    pub async fn update_resource(
        &self,
        store: &dyn ObjectStore,
        drift_detection: bool,
        dry_run: bool,
        exclusions: &[DriftExclusion],
        document: &Document,
        subresources: &[String],
    ) -> Result<Document> {
        let mut proposed = document.clone();

        if drift_detection && !exclusions.is_empty() && self.exists(store, &proposed).await? {
            let patches = transform_drift_exclusions_to_patches(exclusions);
            let removed = apply_patches(&mut proposed, &patches)?;
            debug!(removed, "Applied drift exclusions");
        }

        let written = if is_crd(&proposed) {
            self.write_crd(store, &proposed, dry_run).await
        } else {
            self.server_side_apply(store, &proposed, dry_run).await
        };

        let applied = match written {
            Ok(applied) => applied,
            Err(e) if dry_run && e.is_namespace_not_found() => {
                info!(error = %e, "Namespace missing, dry-run treated as create");
                return Ok(proposed);
            }
            Err(e) => return Err(e.into()),
        };

        for subresource in subresources {
            self.apply_subresource(store, &proposed, subresource, dry_run)
                .await;
        }

        Ok(applied)
    }

    async fn exists(&self, store: &dyn ObjectStore, document: &Document) -> Result<bool> {
        let found = store
            .get(&document.gvk(), namespace_of(document), document.name())
            .await?;
        Ok(found.is_some())
    }

    async fn server_side_apply(
        &self,
        store: &dyn ObjectStore,
        document: &Document,
        dry_run: bool,
    ) -> Result<Document, StoreError> {
        let options = PatchOptions::apply(&self.field_manager)
            .force()
            .with_dry_run(dry_run);
        self.retry
            .run(|| store.patch(document, &options))
            .await
    }

    async fn write_crd(
        &self,
        store: &dyn ObjectStore,
        document: &Document,
        dry_run: bool,
    ) -> Result<Document, StoreError> {
        let options = &WriteOptions::dry_run(dry_run);
        self.retry
            .run(|| async move {
                match store.get(&document.gvk(), None, document.name()).await? {
                    None => store.create(document, options).await,
                    Some(current) => {
                        let mut next = document.clone();
                        if let Some(version) = current.resource_version() {
                            next.set_resource_version(version);
                        }
                        store.update(&next, options).await
                    }
                }
            })
            .await
    }

    async fn apply_subresource(
        &self,
        store: &dyn ObjectStore,
        document: &Document,
        subresource: &str,
        dry_run: bool,
    ) {
        if !document.as_map().contains_key(subresource) {
            return;
        }
        let options = PatchOptions::apply(&self.field_manager)
            .force()
            .with_dry_run(dry_run);
        if let Err(e) = store
            .patch_subresource(document, subresource, &options)
            .await
        {
            warn!(subresource, error = %e, "Failed to apply subresource");
        }
    }
}

fn is_crd(document: &Document) -> bool {
    let gvk = crd_gvk();
    document.kind() == gvk.kind && document.gvk().group == gvk.group
}
