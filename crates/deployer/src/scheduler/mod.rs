//! # Deployment Scheduler
//!
//! Deduplicating job queue and worker pool. Callers ask for a deployment
//! with [`Scheduler::deploy`]; at most one handler runs per [`RequestKey`]
//! at a time, and requests arriving while a run is in flight collapse into
//! a single follow-up run so the latest desired state always wins.
//!
//! [`Scheduler::process_requests`] drives the pool: on every tick it starts
//! queued jobs until the concurrency limit is reached. Each handler gets a
//! child [`CancellationToken`]; cancelling the parent stops new launches and
//! is visible to running handlers, which are left to finish on their own.

mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeployerConfig;
use crate::error::{DeployerError, Result};
use crate::key::{ClusterKind, RequestKey};
use crate::store::ObjectStore;

use state::{Admission, Job, State};

/// Shortest tick the worker pool runs at; `tokio::time::interval` rejects zero
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Options forwarded verbatim to the handler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployOptions {
    /// Detach resources instead of deleting them on cleanup
    pub leave_policies: bool,
    pub drift_detection: bool,
    pub dry_run: bool,
    /// Options this crate does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Everything a handler needs to know about the work it was given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub key: RequestKey,
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub requester: String,
    pub feature_id: String,
    pub cluster_kind: ClusterKind,
    pub cleanup: bool,
    pub options: DeployOptions,
}

impl DeployRequest {
    fn from_job(job: &Job) -> Result<Self> {
        let fields = job.key.fields()?;
        Ok(Self {
            key: job.key.clone(),
            cluster_namespace: fields.cluster_namespace,
            cluster_name: fields.cluster_name,
            requester: fields.requester,
            feature_id: fields.feature_id,
            cluster_kind: fields.cluster_kind,
            cleanup: fields.cleanup,
            options: job.options.clone(),
        })
    }
}

/// Deployment handler invoked by a worker
pub type HandlerFn = Arc<
    dyn Fn(CancellationToken, Arc<dyn ObjectStore>, DeployRequest) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Called with the elapsed time after each handler run:
/// `(elapsed, cluster_namespace, cluster_name, feature_id, cluster_kind)`
pub type MetricFn = Arc<dyn Fn(Duration, &str, &str, &str, ClusterKind) + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(CancellationToken, Arc<dyn ObjectStore>, DeployRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |token, store, request| f(token, store, request).boxed())
}

/// Wrap a closure as a [`MetricFn`]
pub fn metric_fn<F>(f: F) -> MetricFn
where
    F: Fn(Duration, &str, &str, &str, ClusterKind) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Nothing is known about the key
    Unavailable,
    InProgress,
    Queued,
    Deployed,
    /// A cleanup run finished successfully
    Removed,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unavailable => "Unavailable",
            Self::InProgress => "InProgress",
            Self::Queued => "Queued",
            Self::Deployed => "Deployed",
            Self::Removed => "Removed",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a key as seen by [`Scheduler::get_result`]
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub status: ResultStatus,
    /// The handler error, verbatim, when `status` is `Failed`
    pub error: Option<Arc<anyhow::Error>>,
}

impl DeployResult {
    fn status(status: ResultStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }
}

struct Inner {
    state: Mutex<State>,
    store: Arc<dyn ObjectStore>,
}

/// Shared handle to the scheduler; clones refer to the same queue
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler whose handlers receive `store`
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                store,
            }),
        }
    }

    /// Register a feature id. Must happen once, before the first deploy using it.
    pub fn register_feature_id(&self, feature_id: &str) -> Result<()> {
        if self.lock().register_feature(feature_id) {
            debug!(feature_id, "Registered feature");
            Ok(())
        } else {
            Err(DeployerError::AlreadyRegistered(feature_id.to_string()))
        }
    }

    /// Request a deployment for `key`.
    ///
    /// A key already running is only marked dirty; it re-queues itself when
    /// the current run completes. A key already queued is left alone.
    /// Otherwise a job is queued and any stored result is discarded.
    pub fn deploy(
        &self,
        key: &RequestKey,
        handler: HandlerFn,
        metric: Option<MetricFn>,
        options: DeployOptions,
    ) -> Result<()> {
        let (_, feature_id) = key.requester_and_feature()?;

        let mut state = self.lock();
        if !state.is_registered(&feature_id) {
            return Err(DeployerError::UnregisteredFeature(feature_id));
        }

        let admission = state.admit(Job {
            key: key.clone(),
            handler,
            metric,
            options,
        });
        drop(state);

        match admission {
            Admission::Queued => debug!(%key, "Queued deployment"),
            Admission::MarkedDirty => debug!(%key, "Deployment in progress, marked dirty"),
            Admission::AlreadyQueued => debug!(%key, "Deployment already queued"),
        }
        Ok(())
    }

    /// Current status of `key`. Never blocks on I/O.
    #[must_use]
    pub fn get_result(&self, key: &RequestKey) -> DeployResult {
        let state = self.lock();
        if let Some(outcome) = state.result(key) {
            return match outcome {
                Some(err) => DeployResult {
                    status: ResultStatus::Failed,
                    error: Some(Arc::clone(err)),
                },
                None if key.cleanup().unwrap_or(false) => {
                    DeployResult::status(ResultStatus::Removed)
                }
                None => DeployResult::status(ResultStatus::Deployed),
            };
        }

        if state.is_in_progress(key) {
            DeployResult::status(ResultStatus::InProgress)
        } else if state.is_queued(key) {
            DeployResult::status(ResultStatus::Queued)
        } else {
            DeployResult::status(ResultStatus::Unavailable)
        }
    }

    #[must_use]
    pub fn is_in_progress(&self, key: &RequestKey) -> bool {
        self.lock().is_in_progress(key)
    }

    /// Forget everything about `key` except a run already in flight
    pub fn cleanup_entries(&self, key: &RequestKey) {
        self.lock().cleanup(key);
        debug!(%key, "Cleaned up scheduler entries");
    }

    /// Record the outcome of a run.
    ///
    /// If the key was marked dirty while running, a new job with the same
    /// handler is queued and this outcome is dropped.
    pub fn store_result(
        &self,
        key: &RequestKey,
        error: Option<anyhow::Error>,
        options: DeployOptions,
        handler: HandlerFn,
        metric: Option<MetricFn>,
    ) {
        self.complete(
            Job {
                key: key.clone(),
                handler,
                metric,
                options,
            },
            error,
        );
    }

    /// Run the worker pool until `token` is cancelled.
    ///
    /// A zero concurrency limit is raised to one and a zero tick interval to
    /// one millisecond.
    pub async fn process_requests(
        &self,
        token: CancellationToken,
        concurrency_limit: usize,
        tick_interval: Duration,
    ) {
        if concurrency_limit == 0 {
            warn!("Concurrency limit of zero would never run anything, using 1");
        }
        if tick_interval < MIN_TICK_INTERVAL {
            warn!(
                tick_interval_ms = tick_interval.as_millis(),
                "Tick interval too short, using 1ms"
            );
        }
        let concurrency_limit = concurrency_limit.max(1);
        let tick_interval = tick_interval.max(MIN_TICK_INTERVAL);

        info!(
            concurrency_limit,
            tick_interval_ms = tick_interval.as_millis(),
            "Starting deployment scheduler"
        );

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("Deployment scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let ready = self.lock().take_ready(concurrency_limit);
            for job in ready {
                self.spawn_worker(job, token.child_token());
            }
        }
    }

    /// [`Self::process_requests`] using the configured limits
    pub async fn run(&self, token: CancellationToken, config: &DeployerConfig) {
        self.process_requests(token, config.worker_concurrency, config.tick_interval())
            .await;
    }

    fn spawn_worker(&self, job: Job, token: CancellationToken) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let error = scheduler.execute(&job, token).await.err();
            scheduler.complete(job, error);
        });
    }

    async fn execute(&self, job: &Job, token: CancellationToken) -> anyhow::Result<()> {
        let request = DeployRequest::from_job(job)?;
        let started = Instant::now();
        info!(key = %job.key, "Running deployment");

        // A panicking handler must still release the key
        let run = (job.handler)(token, Arc::clone(&self.inner.store), request.clone());
        let outcome = match tokio::spawn(run).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(anyhow!("deployment handler aborted: {join_error}")),
        };

        let elapsed = started.elapsed();
        if let Some(metric) = &job.metric {
            metric(
                elapsed,
                &request.cluster_namespace,
                &request.cluster_name,
                &request.feature_id,
                request.cluster_kind,
            );
        }

        match &outcome {
            Ok(()) => info!(key = %job.key, elapsed_ms = elapsed.as_millis(), "Deployment finished"),
            Err(e) => warn!(key = %job.key, error = %e, "Deployment failed"),
        }
        outcome
    }

    fn complete(&self, job: Job, error: Option<anyhow::Error>) {
        let key = job.key.clone();
        if self.lock().complete(job, error) {
            debug!(%key, "Newer request arrived during run, re-queued");
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| {
            error!("Scheduler state lock was poisoned");
            PoisonError::into_inner(poisoned)
        })
    }
}
