//! # Manifest Deployment
//!
//! The per-document pipeline a deployment handler runs against one cluster:
//!
//! 1. place a namespaced document without a namespace into `default`
//! 2. stamp provenance, ownership and the content hash onto the document
//! 3. check ownership with [`can_deploy_resource_with_default`]
//! 4. write it with the [`ResourceApplier`]
//!
//! Each document yields one [`ResourceReport`]. Profiles that lost a resource
//! to a higher-priority tier are collected so the caller can reconcile them.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::apply::ResourceApplier;
use crate::config::DeployerConfig;
use crate::conflict::{
    can_deploy_resource_with_default, ProfileRef, ReferenceRef, ResourceInfo, Tier,
};
use crate::document::{Document, ResourceIdentity};
use crate::drift::DriftExclusion;
use crate::error::{DeployerError, Result};
use crate::hash::evaluate_resource_diff;
use crate::labels::mark_deployed;
use crate::probe::CrdProbe;
use crate::report::{ReportAction, ResourceReport};
use crate::scheduler::DeployOptions;
use crate::store::ObjectStore;

/// Namespace given to namespaced documents that do not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Who is deploying what, and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    /// Source object the documents were rendered from
    pub reference: ReferenceRef,
    pub profile: ProfileRef,
    /// Falls back to the deployer's default tier when unset
    pub tier: Option<Tier>,
    pub options: DeployOptions,
    pub drift_exclusions: Vec<DriftExclusion>,
    /// Subresources (for example `status`) to apply after each body
    pub subresources: Vec<String>,
}

impl DeploymentRequest {
    #[must_use]
    pub fn new(reference: ReferenceRef, profile: ProfileRef) -> Self {
        Self {
            reference,
            profile,
            tier: None,
            options: DeployOptions::default(),
            drift_exclusions: Vec::new(),
            subresources: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_drift_exclusions(mut self, exclusions: Vec<DriftExclusion>) -> Self {
        self.drift_exclusions = exclusions;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentOutcome {
    pub reports: Vec<ResourceReport>,
    /// Identities of every document handled, the desired set for cleanup
    pub deployed: HashSet<ResourceIdentity>,
    /// Profiles that lost ownership of a resource and must be reconciled
    pub requeue_profiles: Vec<ProfileRef>,
}

pub struct ManifestDeployer {
    applier: ResourceApplier,
    drift_probe: Arc<CrdProbe>,
    default_tier: Tier,
}

impl ManifestDeployer {
    #[must_use]
    pub fn new(applier: ResourceApplier, drift_probe: Arc<CrdProbe>) -> Self {
        Self {
            applier,
            drift_probe,
            default_tier: Tier::DEFAULT,
        }
    }

    /// Tier for requests that carry none, and for owners whose recorded tier
    /// is missing or unparseable
    #[must_use]
    pub fn with_default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    #[must_use]
    pub fn from_config(config: &DeployerConfig) -> Self {
        Self::new(
            ResourceApplier::from_config(config),
            Arc::new(CrdProbe::resource_summary()),
        )
        .with_default_tier(config.default_tier())
    }

    /// Deploy `documents` into `store` on behalf of `request.profile`.
    ///
    /// A conflict the requester cannot win aborts a live run with
    /// [`DeployerError::Conflict`]; in dry-run it becomes a `Conflict` report
    /// and the remaining documents are still evaluated.
    #[instrument(skip_all, fields(profile = %request.profile, reference = %request.reference))]
    pub async fn deploy_documents(
        &self,
        store: &dyn ObjectStore,
        documents: &[Document],
        request: &DeploymentRequest,
    ) -> Result<DeploymentOutcome> {
        let dry_run = request.options.dry_run;
        let tier = request.tier.unwrap_or(self.default_tier);
        let drift_detection = self.drift_detection_enabled(store, request).await?;
        let mut outcome = DeploymentOutcome::default();

        for original in documents {
            original.validate()?;
            let mut document = original.clone();
            if document.namespace().is_empty() && store.is_namespaced(&document.gvk()).await? {
                debug!(resource = %document.identity(), "Defaulting namespace");
                document.set_namespace(DEFAULT_NAMESPACE);
            }
            let hash = mark_deployed(&mut document, &request.reference, &request.profile, tier)?;
            let identity = document.identity();

            let info = match can_deploy_resource_with_default(
                store,
                &document,
                &request.reference,
                &request.profile,
                tier,
                self.default_tier,
            )
            .await
            {
                Ok((info, requeue_owner)) => {
                    if requeue_owner {
                        record_dispossessed(&mut outcome, info.as_ref());
                    }
                    info
                }
                Err(DeployerError::Conflict(conflict)) if dry_run => {
                    debug!(resource = %identity, "Conflict reported in dry-run");
                    outcome.reports.push(
                        ResourceReport::new(identity, ReportAction::Conflict)
                            .with_message(conflict.message),
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let report = match &info {
                None => ResourceReport::new(identity.clone(), ReportAction::Create),
                Some(info) if info.hash == hash => {
                    ResourceReport::new(identity.clone(), ReportAction::NoAction)
                }
                Some(info) if dry_run => {
                    ResourceReport::new(identity.clone(), ReportAction::Update)
                        .with_message(evaluate_resource_diff(&info.current, &document)?)
                }
                Some(_) => ResourceReport::new(identity.clone(), ReportAction::Update),
            };

            self.applier
                .update_resource(
                    store,
                    drift_detection,
                    dry_run,
                    &request.drift_exclusions,
                    &document,
                    &request.subresources,
                )
                .await?;

            outcome.deployed.insert(identity);
            outcome.reports.push(report);
        }

        info!(
            resources = outcome.reports.len(),
            requeue = outcome.requeue_profiles.len(),
            dry_run,
            "Deployed documents"
        );
        Ok(outcome)
    }

    async fn drift_detection_enabled(
        &self,
        store: &dyn ObjectStore,
        request: &DeploymentRequest,
    ) -> Result<bool> {
        if !request.options.drift_detection {
            return Ok(false);
        }
        if self.drift_probe.is_installed(store).await? {
            return Ok(true);
        }
        warn!(
            crd = self.drift_probe.name(),
            "Drift detection requested but CRD is not installed, applying without exclusions"
        );
        Ok(false)
    }
}

fn record_dispossessed(outcome: &mut DeploymentOutcome, info: Option<&ResourceInfo>) {
    let Some(owner) = info.and_then(ResourceInfo::owner) else {
        return;
    };
    if !outcome.requeue_profiles.contains(&owner) {
        info!(owner = %owner, "Requeueing previous owner");
        outcome.requeue_profiles.push(owner);
    }
}
