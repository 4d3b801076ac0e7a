//! # Stale Resource Cleanup
//!
//! When a profile stops wanting a resource, the copy in the cluster is
//! either deleted or, with `leave_policies`, detached: its provenance labels
//! and ownership annotations are stripped and the object stays in place.
//!
//! Only resources this system created (they carry the provenance label) and
//! that the profile still owns are ever touched.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::DeployerConfig;
use crate::conflict::ProfileRef;
use crate::document::{Document, ResourceIdentity};
use crate::error::Result;
use crate::labels::{
    has_provenance, strip_management_metadata, OWNER_KIND_ANNOTATION, OWNER_NAME_ANNOTATION,
};
use crate::report::{ReportAction, ResourceReport};
use crate::retry::RetryPolicy;
use crate::store::{ObjectStore, StoreError, WriteOptions};

/// Resources annotated with `key: value` are never cleaned up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipAnnotation {
    pub key: String,
    pub value: String,
}

impl SkipAnnotation {
    #[must_use]
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        document.annotation(&self.key) == Some(self.value.as_str())
    }
}

/// Removes or detaches resources a profile no longer wants
#[derive(Debug, Clone, Default)]
pub struct StaleResourceCleaner {
    skip: Option<SkipAnnotation>,
    retry: RetryPolicy,
}

impl StaleResourceCleaner {
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        Self { skip: None, retry }
    }

    #[must_use]
    pub fn from_config(config: &DeployerConfig) -> Self {
        Self::new(RetryPolicy::from_settings(&config.retry))
    }

    /// Never clean up resources carrying `skip`
    #[must_use]
    pub fn with_skip_annotation(mut self, skip: SkipAnnotation) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Remove `candidate` from the cluster if it is no longer desired.
    ///
    /// Returns the `Delete` report when the resource was (or, in dry-run,
    /// would be) removed or detached, and `None` when it was left alone.
    #[instrument(skip_all, fields(resource = %candidate.identity(), profile = %profile))]
    pub async fn undeploy_stale_resource(
        &self,
        store: &dyn ObjectStore,
        profile: &ProfileRef,
        leave_policies: bool,
        dry_run: bool,
        candidate: &Document,
        desired: &HashSet<ResourceIdentity>,
    ) -> Result<Option<ResourceReport>> {
        let identity = candidate.identity();

        if !has_provenance(candidate) {
            debug!("Not deployed by this system, skipping");
            return Ok(None);
        }
        if self.skip.as_ref().is_some_and(|skip| skip.matches(candidate)) {
            debug!("Skip annotation present, leaving resource");
            return Ok(None);
        }
        if desired.contains(&identity) || !is_owned_by(candidate, profile) {
            return Ok(None);
        }

        let report = ResourceReport::new(identity.clone(), ReportAction::Delete);
        if dry_run {
            return Ok(Some(report));
        }

        if leave_policies {
            self.detach(store, &identity).await?;
            info!("Detached stale resource");
            return Ok(Some(report.with_message("resource left in cluster")));
        }

        match store
            .delete(
                &identity.gvk(),
                identity.namespace(),
                &identity.name,
                &WriteOptions::default(),
            )
            .await
        {
            Ok(()) => info!("Deleted stale resource"),
            Err(e) if e.is_not_found() => debug!("Stale resource already gone"),
            Err(e) => return Err(e.into()),
        }
        Ok(Some(report))
    }

    /// Apply [`Self::undeploy_stale_resource`] to every candidate, collecting
    /// reports
    pub async fn undeploy_stale_resources(
        &self,
        store: &dyn ObjectStore,
        profile: &ProfileRef,
        leave_policies: bool,
        dry_run: bool,
        candidates: &[Document],
        desired: &HashSet<ResourceIdentity>,
    ) -> Result<Vec<ResourceReport>> {
        let mut reports = Vec::new();
        for candidate in candidates {
            if let Some(report) = self
                .undeploy_stale_resource(store, profile, leave_policies, dry_run, candidate, desired)
                .await?
            {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    async fn detach(
        &self,
        store: &dyn ObjectStore,
        identity: &ResourceIdentity,
    ) -> Result<(), StoreError> {
        let gvk = &identity.gvk();
        self.retry
            .run(|| async move {
                let Some(mut current) = store
                    .get(gvk, identity.namespace(), &identity.name)
                    .await?
                else {
                    return Ok(());
                };
                strip_management_metadata(&mut current);
                store.update(&current, &WriteOptions::default()).await?;
                Ok(())
            })
            .await
    }
}

/// Owned by annotation or by owner reference
fn is_owned_by(document: &Document, profile: &ProfileRef) -> bool {
    let by_annotation = document.annotation(OWNER_KIND_ANNOTATION) == Some(profile.kind.as_str())
        && document.annotation(OWNER_NAME_ANNOTATION) == Some(profile.name.as_str());

    by_annotation
        || document
            .owner_references()
            .iter()
            .any(|owner| owner.kind == profile.kind && owner.name == profile.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ReferenceRef, Tier};
    use crate::labels::{mark_deployed, REFERENCE_KIND_LABEL};
    use crate::store::memory::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn cleaner() -> StaleResourceCleaner {
        StaleResourceCleaner::new(RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            jitter: 0.0,
            ..RetryPolicy::on_conflict()
        })
    }

    fn profile() -> ProfileRef {
        ProfileRef::new("ClusterProfile", "base")
    }

    fn config_map(name: &str) -> Document {
        Document::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "apps"},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    fn deployed(name: &str, owner: &ProfileRef) -> Document {
        let mut doc = config_map(name);
        mark_deployed(
            &mut doc,
            &ReferenceRef::new("ConfigMap", "mgmt", "source"),
            owner,
            Tier::DEFAULT,
        )
        .unwrap();
        doc
    }

    fn seeded(docs: &[Document]) -> (InMemoryStore, Vec<Document>) {
        let store = InMemoryStore::new();
        store.add_namespace("apps");
        let stored = docs.iter().map(|d| store.insert(d.clone()).unwrap()).collect();
        (store, stored)
    }

    fn gvk() -> crate::document::GroupVersionKind {
        crate::document::GroupVersionKind::new("", "v1", "ConfigMap")
    }

    #[tokio::test]
    async fn test_deletes_stale_owned_resource() {
        let (store, stored) =
            seeded(&[deployed("stale", &profile()), deployed("kept", &profile())]);
        let desired: HashSet<_> = [stored[1].identity()].into_iter().collect();

        let reports = cleaner()
            .undeploy_stale_resources(&store, &profile(), false, false, &stored, &desired)
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].action, ReportAction::Delete);
        assert_eq!(reports[0].resource.name, "stale");
        assert!(store.snapshot(&gvk(), Some("apps"), "stale").is_none());
        assert!(store.snapshot(&gvk(), Some("apps"), "kept").is_some());
    }

    #[tokio::test]
    async fn test_dry_run_only_reports() {
        let (store, stored) = seeded(&[deployed("stale", &profile())]);

        let report = cleaner()
            .undeploy_stale_resource(&store, &profile(), false, true, &stored[0], &HashSet::new())
        .await
        .unwrap();

        assert_eq!(report.unwrap().action, ReportAction::Delete);
        assert!(store.snapshot(&gvk(), Some("apps"), "stale").is_some());
    }

    #[tokio::test]
    async fn test_leave_policies_detaches() {
        let (store, stored) = seeded(&[deployed("stale", &profile())]);

        cleaner()
            .undeploy_stale_resource(&store, &profile(), true, false, &stored[0], &HashSet::new())
        .await
        .unwrap()
        .unwrap();

        let left = store.snapshot(&gvk(), Some("apps"), "stale").unwrap();
        assert!(left.label(REFERENCE_KIND_LABEL).is_none());
        assert!(left.annotation(OWNER_NAME_ANNOTATION).is_none());
        assert_eq!(left.field(&["data", "k"]), Some(&json!("v")));
    }

    #[tokio::test]
    async fn test_untouched_cases() {
        let other = ProfileRef::new("Profile", "other");
        let mut skipped = deployed("skipped", &profile());
        skipped.set_annotation("example.com/keep", "true");
        let (store, stored) = seeded(&[
            config_map("foreign"),
            deployed("not-ours", &other),
            skipped,
        ]);
        let skip = SkipAnnotation::new("example.com/keep", "true");

        let reports = cleaner()
            .with_skip_annotation(skip)
            .undeploy_stale_resources(&store, &profile(), false, false, &stored, &HashSet::new())
            .await
            .unwrap();

        assert!(reports.is_empty());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_owner_reference_counts_as_ownership() {
        let mut doc = deployed("owned", &ProfileRef::new("Profile", "other"));
        doc.as_map_mut()["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "config.projectsveltos.io/v1beta1",
            "kind": "ClusterProfile",
            "name": "base",
            "uid": "1234"
        }]);
        let (store, stored) = seeded(&[doc]);

        let report = cleaner()
            .undeploy_stale_resource(&store, &profile(), false, false, &stored[0], &HashSet::new())
        .await
        .unwrap();

        assert!(report.is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_already_deleted_is_not_an_error() {
        let (store, stored) = seeded(&[deployed("gone", &profile())]);
        store
            .delete(&gvk(), Some("apps"), "gone", &WriteOptions::default())
            .await
            .unwrap();

        let report = cleaner()
            .undeploy_stale_resource(&store, &profile(), false, false, &stored[0], &HashSet::new())
        .await
        .unwrap();
        assert!(report.is_some());
    }

    #[tokio::test]
    async fn test_detach_follows_retry_policy() {
        let single_attempt = StaleResourceCleaner::new(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::on_conflict()
        });
        let (store, stored) = seeded(&[deployed("stale", &profile())]);
        store.fail_next_writes_with_conflict(1);

        let err = single_attempt
            .undeploy_stale_resource(&store, &profile(), true, false, &stored[0], &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::DeployerError::Store(StoreError::Conflict { .. })
        ));
        let left = store.snapshot(&gvk(), Some("apps"), "stale").unwrap();
        assert!(left.annotation(OWNER_NAME_ANNOTATION).is_some());

        store.fail_next_writes_with_conflict(1);
        cleaner()
            .undeploy_stale_resource(&store, &profile(), true, false, &stored[0], &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        let left = store.snapshot(&gvk(), Some("apps"), "stale").unwrap();
        assert!(left.annotation(OWNER_NAME_ANNOTATION).is_none());
    }

    #[test]
    fn test_from_config_uses_retry_settings() {
        let config = DeployerConfig::from_yaml_str("retry:\n  maxAttempts: 2\n").unwrap();
        assert_eq!(StaleResourceCleaner::from_config(&config).retry.max_attempts, 2);
    }
}
