//! Remote object store abstraction.
//!
//! Every remote cluster is reached through [`ObjectStore`]: a store of
//! documents keyed by group/version/kind, namespace and name, with
//! optimistic-concurrency resource versions.

pub mod kube;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::document::{Document, GroupVersionKind};

/// Errors returned by an object store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Stale resource version; safe to retry after re-reading
    #[error("Conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },

    #[error("Resource already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Check whether this is an optimistic-concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, Self::NamespaceNotFound(_))
    }
}

/// Options for create, update and delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Validate and return the would-be result without persisting it
    pub dry_run: bool,
}

impl WriteOptions {
    #[must_use]
    pub fn dry_run(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

/// Options for server-side apply patches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    pub field_manager: String,
    /// Take ownership of fields managed by other field managers
    pub force: bool,
    pub dry_run: bool,
}

impl PatchOptions {
    #[must_use]
    pub fn apply(field_manager: &str) -> Self {
        Self {
            field_manager: field_manager.to_string(),
            force: false,
            dry_run: false,
        }
    }

    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A remote store of resource documents
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a document; `Ok(None)` when it does not exist
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn create(
        &self,
        document: &Document,
        options: &WriteOptions,
    ) -> Result<Document, StoreError>;

    /// Replace a document; a set resource version must match the stored one
    async fn update(
        &self,
        document: &Document,
        options: &WriteOptions,
    ) -> Result<Document, StoreError>;

    /// Server-side apply the document
    async fn patch(
        &self,
        document: &Document,
        options: &PatchOptions,
    ) -> Result<Document, StoreError>;

    /// Server-side apply one subresource (for example `status`) of the document
    async fn patch_subresource(
        &self,
        document: &Document,
        subresource: &str,
        options: &PatchOptions,
    ) -> Result<Document, StoreError>;

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        options: &WriteOptions,
    ) -> Result<(), StoreError>;

    /// Whether resources of this kind live inside a namespace
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, StoreError>;
}

pub(crate) fn namespace_of(document: &Document) -> Option<&str> {
    let namespace = document.namespace();
    if namespace.is_empty() {
        None
    } else {
        Some(namespace)
    }
}
