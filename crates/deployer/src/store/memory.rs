//! In-process object store.
//!
//! Behaves like an API server for the operations the engine uses: resource
//! versions increase monotonically, stale versions are rejected, namespaced
//! writes require the namespace to exist, and dry-run never persists. The
//! `default` namespace always exists, and a fixed set of built-in kinds
//! (plus any registered with [`InMemoryStore::add_cluster_scoped_kind`]) is
//! cluster-scoped.
//! Server-side apply is modelled as a recursive merge of the applied fields
//! onto the stored object.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{namespace_of, ObjectStore, PatchOptions, StoreError, WriteOptions};
use crate::deploy::DEFAULT_NAMESPACE;
use crate::document::{Document, GroupVersionKind};

/// (group, kind, namespace, name); versions of the same kind share storage
type ObjectKey = (String, String, String, String);

/// (group, kind) of built-in cluster-scoped resources
const CLUSTER_SCOPED_KINDS: [(&str, &str); 11] = [
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("apiregistration.k8s.io", "APIService"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("scheduling.k8s.io", "PriorityClass"),
    ("storage.k8s.io", "StorageClass"),
];

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Document>,
    namespaces: HashSet<String>,
    cluster_scoped: HashSet<(String, String)>,
    next_version: u64,
    pending_conflicts: usize,
    writes: usize,
}

impl Inner {
    fn bump(&mut self, document: &mut Document) {
        self.next_version += 1;
        document.set_resource_version(&self.next_version.to_string());
    }

    fn take_injected_conflict(&mut self, resource: &str) -> Result<(), StoreError> {
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            return Err(StoreError::Conflict {
                resource: resource.to_string(),
                message: "injected conflict".to_string(),
            });
        }
        Ok(())
    }

    fn require_namespace(&self, document: &Document) -> Result<(), StoreError> {
        match namespace_of(document) {
            Some(ns) if !self.namespaces.contains(ns) => {
                Err(StoreError::NamespaceNotFound(ns.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn track_namespace(&mut self, document: &Document) {
        if document.kind() == "Namespace" && document.gvk().group.is_empty() {
            self.namespaces.insert(document.name().to_string());
        }
    }
}

/// Object store kept entirely in memory
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.namespaces.insert(DEFAULT_NAMESPACE.to_string());
        inner.cluster_scoped = CLUSTER_SCOPED_KINDS
            .iter()
            .map(|(group, kind)| ((*group).to_string(), (*kind).to_string()))
            .collect();
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Register a namespace so namespaced writes into it succeed
    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.insert(namespace.to_string());
    }

    /// Treat `group`/`kind` as cluster-scoped, for custom resources
    pub fn add_cluster_scoped_kind(&self, group: &str, kind: &str) {
        self.lock()
            .cluster_scoped
            .insert((group.to_string(), kind.to_string()));
    }

    /// Seed a document directly, bypassing every check except the document's shape
    pub fn insert(&self, mut document: Document) -> Result<Document, StoreError> {
        document
            .validate()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut inner = self.lock();
        inner.bump(&mut document);
        inner.track_namespace(&document);
        inner.objects.insert(key_of(&document), document.clone());
        Ok(document)
    }

    /// Make the next `count` writes fail with a resource-version conflict
    pub fn fail_next_writes_with_conflict(&self, count: usize) {
        self.lock().pending_conflicts = count;
    }

    /// Number of persisted (non dry-run) writes so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronous lookup for assertions
    #[must_use]
    pub fn snapshot(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<Document> {
        self.lock()
            .objects
            .get(&lookup_key(gvk, namespace, name))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.snapshot(gvk, namespace, name))
    }

    async fn create(
        &self,
        document: &Document,
        options: &WriteOptions,
    ) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        let resource = document.identity().to_string();
        inner.take_injected_conflict(&resource)?;
        inner.require_namespace(document)?;

        let key = key_of(document);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { resource });
        }

        let mut created = document.clone();
        if options.dry_run {
            created.clear_resource_version();
            return Ok(created);
        }
        inner.bump(&mut created);
        inner.track_namespace(&created);
        inner.writes += 1;
        inner.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        document: &Document,
        options: &WriteOptions,
    ) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        let resource = document.identity().to_string();
        inner.take_injected_conflict(&resource)?;

        let key = key_of(document);
        let stored_version = inner
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound {
                resource: resource.clone(),
            })?
            .resource_version()
            .map(ToString::to_string);
        check_version(document, stored_version.as_deref(), &resource)?;

        let mut updated = document.clone();
        if options.dry_run {
            if let Some(version) = stored_version {
                updated.set_resource_version(&version);
            }
            return Ok(updated);
        }
        inner.bump(&mut updated);
        inner.writes += 1;
        inner.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch(
        &self,
        document: &Document,
        options: &PatchOptions,
    ) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        let resource = document.identity().to_string();
        inner.take_injected_conflict(&resource)?;

        let key = key_of(document);
        let mut applied = match inner.objects.get(&key) {
            Some(existing) => {
                check_version(document, existing.resource_version(), &resource)?;
                let mut merged = existing.clone().into_value();
                merge(&mut merged, &document.clone().into_value());
                Document::from_value(merged)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?
            }
            None => {
                inner.require_namespace(document)?;
                let mut created = document.clone();
                created.clear_resource_version();
                created
            }
        };

        if options.dry_run {
            return Ok(applied);
        }
        inner.bump(&mut applied);
        inner.track_namespace(&applied);
        inner.writes += 1;
        inner.objects.insert(key, applied.clone());
        Ok(applied)
    }

    async fn patch_subresource(
        &self,
        document: &Document,
        subresource: &str,
        options: &PatchOptions,
    ) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        let resource = document.identity().to_string();
        let key = key_of(document);
        let mut updated = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound { resource })?;

        if let Some(value) = document.as_map().get(subresource) {
            let target = updated
                .as_map_mut()
                .entry(subresource)
                .or_insert_with(|| Value::Object(Map::new()));
            merge(target, value);
        }

        if options.dry_run {
            return Ok(updated);
        }
        inner.bump(&mut updated);
        inner.writes += 1;
        inner.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        options: &WriteOptions,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = lookup_key(gvk, namespace, name);
        if !inner.objects.contains_key(&key) {
            return Err(StoreError::NotFound {
                resource: format!("{}:{}/{}", gvk.kind, namespace.unwrap_or_default(), name),
            });
        }
        if !options.dry_run {
            inner.objects.remove(&key);
            inner.writes += 1;
        }
        Ok(())
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError> {
        let scope = (gvk.group.clone(), gvk.kind.clone());
        Ok(!self.lock().cluster_scoped.contains(&scope))
    }
}

fn key_of(document: &Document) -> ObjectKey {
    lookup_key(&document.gvk(), namespace_of(document), document.name())
}

fn lookup_key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    (
        gvk.group.clone(),
        gvk.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn check_version(
    document: &Document,
    stored: Option<&str>,
    resource: &str,
) -> Result<(), StoreError> {
    match (document.resource_version(), stored) {
        (Some(requested), Some(stored)) if requested != stored => Err(StoreError::Conflict {
            resource: resource.to_string(),
            message: format!(
                "the object has been modified; resource version {requested} is stale (current {stored})"
            ),
        }),
        _ => Ok(()),
    }
}

/// Recursively merge `patch` into `target`; non-object values replace
fn merge(target: &mut Value, patch: &Value) {
    if let (Value::Object(target_map), Value::Object(patch_map)) = (&mut *target, patch) {
        for (key, value) in patch_map {
            let nested = matches!(
                (target_map.get(key), value),
                (Some(Value::Object(_)), Value::Object(_))
            );
            if nested {
                if let Some(existing) = target_map.get_mut(key) {
                    merge(existing, value);
                }
            } else {
                target_map.insert(key.clone(), value.clone());
            }
        }
        return;
    }
    *target = patch.clone();
}
