//! Deployment handler flows against the in-memory store: rendered manifests
//! are deployed through the scheduler, then a profile change removes or
//! detaches what is no longer wanted.

use std::collections::HashSet;
use std::sync::{Arc, Once};
use std::time::Duration;

use deployer::labels::{OWNER_NAME_ANNOTATION, REFERENCE_KIND_LABEL};
use deployer::scheduler::handler_fn;
use deployer::store::memory::InMemoryStore;
use deployer::{
    ClusterKind, DeployOptions, DeployerConfig, Document, DeploymentRequest, GroupVersionKind,
    ManifestDeployer, ObjectStore, ProfileRef, ReferenceRef, ReportAction, RequestKey,
    ResultStatus, Scheduler, StaleResourceCleaner, Tier,
};
use tokio_util::sync::CancellationToken;

const MANIFESTS: &str = r"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: apps
data:
  level: debug
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
  namespace: apps
spec:
  replicas: 2
";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

fn documents() -> Vec<Document> {
    MANIFESTS
        .split("\n---\n")
        .map(|doc| Document::from_yaml(doc).unwrap())
        .collect()
}

fn cluster() -> Arc<InMemoryStore> {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    store.add_namespace("apps");
    store
}

fn request(profile: &str) -> DeploymentRequest {
    DeploymentRequest::new(
        ReferenceRef::new("ConfigMap", "mgmt", "api-manifests"),
        ProfileRef::new("ClusterProfile", profile),
    )
}

fn config_map_gvk() -> GroupVersionKind {
    GroupVersionKind::new("", "v1", "ConfigMap")
}

#[tokio::test]
async fn test_scheduled_handler_deploys_manifests() {
    let store = cluster();
    let scheduler = Scheduler::new(store.clone());
    scheduler.register_feature_id("resources").unwrap();

    let handler = handler_fn(|_, store: Arc<dyn ObjectStore>, request| async move {
        let deployer = ManifestDeployer::from_config(&DeployerConfig::default());
        let deployment = self::request(&request.requester).with_options(request.options);
        deployer
            .deploy_documents(store.as_ref(), &documents(), &deployment)
            .await?;
        Ok(())
    });
    let key = RequestKey::new("default", "prod", "base", "resources", ClusterKind::Sveltos, false);
    scheduler
        .deploy(&key, handler, None, DeployOptions::default())
        .unwrap();

    let token = CancellationToken::new();
    let worker = scheduler.clone();
    let child = token.clone();
    tokio::spawn(async move {
        worker
            .process_requests(child, 4, Duration::from_millis(10))
            .await;
    });

    tokio::time::timeout(Duration::from_secs(20), async {
        while scheduler.get_result(&key).status != ResultStatus::Deployed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deployment did not finish");
    token.cancel();

    let settings = store
        .snapshot(&config_map_gvk(), Some("apps"), "settings")
        .unwrap();
    assert_eq!(settings.label(REFERENCE_KIND_LABEL), Some("ConfigMap"));
    assert_eq!(settings.annotation(OWNER_NAME_ANNOTATION), Some("base"));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_dry_run_then_live_then_cleanup() {
    let store = cluster();
    let deployer = ManifestDeployer::from_config(&DeployerConfig::default());
    let dry_run = request("base").with_options(DeployOptions {
        dry_run: true,
        ..DeployOptions::default()
    });

    let preview = deployer
        .deploy_documents(store.as_ref(), &documents(), &dry_run)
        .await
        .unwrap();
    assert!(preview
        .reports
        .iter()
        .all(|r| r.action == ReportAction::Create));
    assert!(store.is_empty());

    let live = deployer
        .deploy_documents(store.as_ref(), &documents(), &request("base"))
        .await
        .unwrap();
    assert_eq!(live.reports.len(), 2);
    assert_eq!(store.len(), 2);

    // The profile now only wants the ConfigMap
    let kept = vec![documents().remove(0)];
    let outcome = deployer
        .deploy_documents(store.as_ref(), &kept, &request("base"))
        .await
        .unwrap();
    assert_eq!(outcome.reports[0].action, ReportAction::NoAction);

    let mut candidates = Vec::new();
    for doc in documents() {
        let identity = doc.identity();
        if let Some(current) = store
            .get(&identity.gvk(), identity.namespace(), &identity.name)
            .await
            .unwrap()
        {
            candidates.push(current);
        }
    }

    let removed = StaleResourceCleaner::from_config(&DeployerConfig::default())
        .undeploy_stale_resources(
            store.as_ref(),
            &ProfileRef::new("ClusterProfile", "base"),
            false,
            false,
            &candidates,
            &outcome.deployed,
        )
        .await
        .unwrap();

    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].resource.kind, "Deployment");
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_competing_profiles_resolved_by_tier() {
    let store = cluster();
    let deployer = ManifestDeployer::from_config(&DeployerConfig::default());

    deployer
        .deploy_documents(
            store.as_ref(),
            &documents(),
            &request("team").with_tier(Tier::new(50)),
        )
        .await
        .unwrap();

    let equal = deployer
        .deploy_documents(
            store.as_ref(),
            &documents(),
            &request("rival").with_tier(Tier::new(50)),
        )
        .await
        .unwrap_err();
    assert!(equal.is_conflict());

    let outcome = deployer
        .deploy_documents(
            store.as_ref(),
            &documents(),
            &request("platform").with_tier(Tier::new(10)),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome.requeue_profiles,
        vec![ProfileRef::new("ClusterProfile", "team")]
    );

    // The dispossessed profile no longer owns anything, so its cleanup is a no-op
    let candidates: Vec<_> = documents()
        .iter()
        .filter_map(|doc| {
            let identity = doc.identity();
            store.snapshot(&identity.gvk(), identity.namespace(), &identity.name)
        })
        .collect();
    let removed = StaleResourceCleaner::from_config(&DeployerConfig::default())
        .undeploy_stale_resources(
            store.as_ref(),
            &ProfileRef::new("ClusterProfile", "team"),
            false,
            false,
            &candidates,
            &HashSet::new(),
        )
        .await
        .unwrap();
    assert!(removed.is_empty());
    assert_eq!(store.len(), 2);
}
