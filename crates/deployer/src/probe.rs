//! Lazily cached "is this CRD installed" check.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::Resource;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::document::GroupVersionKind;
use crate::error::Result;
use crate::store::ObjectStore;

/// CRD that must be present for drift detection
pub const RESOURCE_SUMMARY_CRD: &str = "resourcesummaries.lib.projectsveltos.io";

/// Group/version/kind of `CustomResourceDefinition`
#[must_use]
pub fn crd_gvk() -> GroupVersionKind {
    GroupVersionKind::new(
        CustomResourceDefinition::GROUP,
        CustomResourceDefinition::VERSION,
        CustomResourceDefinition::KIND,
    )
}

/// Answers whether a CRD is installed; the first successful lookup is cached
#[derive(Debug)]
pub struct CrdProbe {
    name: String,
    installed: OnceCell<bool>,
}

impl CrdProbe {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            installed: OnceCell::new(),
        }
    }

    /// Probe for the ResourceSummary CRD
    #[must_use]
    pub fn resource_summary() -> Self {
        Self::new(RESOURCE_SUMMARY_CRD)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look the CRD up once. Failed lookups are not cached.
    pub async fn is_installed(&self, store: &dyn ObjectStore) -> Result<bool> {
        let installed = self
            .installed
            .get_or_try_init(|| async {
                let found = store.get(&crd_gvk(), None, &self.name).await?.is_some();
                debug!(crd = %self.name, installed = found, "Probed CRD");
                Ok::<_, crate::error::DeployerError>(found)
            })
            .await?;
        Ok(*installed)
    }
}
