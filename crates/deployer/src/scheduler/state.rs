//! Lock-protected scheduler bookkeeping.
//!
//! Four collections keyed by [`RequestKey`]: `dirty`, `in_progress`, the job
//! queue and `results`. A key is never both queued and in progress; `dirty`
//! may overlap either. Every method is a short critical section with no I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{DeployOptions, HandlerFn, MetricFn};
use crate::key::RequestKey;

/// One unit of queued work
#[derive(Clone)]
pub(crate) struct Job {
    pub key: RequestKey,
    pub handler: HandlerFn,
    pub metric: Option<MetricFn>,
    pub options: DeployOptions,
}

/// What a `Deploy` call did to the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// A fresh job was queued
    Queued,
    /// The key is running; the finished run will re-queue it
    MarkedDirty,
    /// The key was already waiting in the queue
    AlreadyQueued,
}

#[derive(Default)]
pub(crate) struct State {
    features: HashSet<String>,
    dirty: HashSet<RequestKey>,
    in_progress: HashSet<RequestKey>,
    queue: VecDeque<Job>,
    queued: HashSet<RequestKey>,
    results: HashMap<RequestKey, Option<Arc<anyhow::Error>>>,
}

impl State {
    /// Returns false when the feature was already registered
    pub fn register_feature(&mut self, feature_id: &str) -> bool {
        self.features.insert(feature_id.to_string())
    }

    pub fn is_registered(&self, feature_id: &str) -> bool {
        self.features.contains(feature_id)
    }

    pub fn admit(&mut self, job: Job) -> Admission {
        if self.in_progress.contains(&job.key) {
            self.dirty.insert(job.key);
            return Admission::MarkedDirty;
        }
        if self.queued.contains(&job.key) {
            return Admission::AlreadyQueued;
        }

        self.results.remove(&job.key);
        self.dirty.insert(job.key.clone());
        self.enqueue(job);
        Admission::Queued
    }

    /// Move up to `limit - in_progress` jobs from the queue into progress
    pub fn take_ready(&mut self, limit: usize) -> Vec<Job> {
        let mut ready = Vec::new();
        while self.in_progress.len() < limit {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&job.key);
            self.dirty.remove(&job.key);
            self.in_progress.insert(job.key.clone());
            ready.push(job);
        }
        ready
    }

    /// Record a finished run. Returns true when the key was re-queued because
    /// a newer `Deploy` arrived while it was running.
    pub fn complete(&mut self, job: Job, error: Option<anyhow::Error>) -> bool {
        self.in_progress.remove(&job.key);

        if self.dirty.contains(&job.key) {
            // A newer request superseded this outcome
            self.results.remove(&job.key);
            self.enqueue(job);
            return true;
        }

        self.results.insert(job.key, error.map(Arc::new));
        false
    }

    pub fn cleanup(&mut self, key: &RequestKey) {
        self.dirty.remove(key);
        self.results.remove(key);
        if self.queued.remove(key) {
            self.queue.retain(|job| &job.key != key);
        }
    }

    pub fn result(&self, key: &RequestKey) -> Option<&Option<Arc<anyhow::Error>>> {
        self.results.get(key)
    }

    pub fn is_in_progress(&self, key: &RequestKey) -> bool {
        self.in_progress.contains(key)
    }

    pub fn is_queued(&self, key: &RequestKey) -> bool {
        self.queued.contains(key)
    }

    #[cfg(test)]
    pub fn is_dirty(&self, key: &RequestKey) -> bool {
        self.dirty.contains(key)
    }

    #[cfg(test)]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    fn enqueue(&mut self, job: Job) {
        if self.queued.insert(job.key.clone()) {
            self.queue.push_back(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ClusterKind;
    use crate::scheduler::handler_fn;

    fn key(name: &str) -> RequestKey {
        RequestKey::new("default", name, "profile", "helm", ClusterKind::Capi, false)
    }

    fn job(key: RequestKey) -> Job {
        Job {
            key,
            handler: handler_fn(|_, _, _| async { Ok(()) }),
            metric: None,
            options: DeployOptions::default(),
        }
    }

    #[test]
    fn test_admit_then_take() {
        let mut state = State::default();
        let k = key("c1");

        assert_eq!(state.admit(job(k.clone())), Admission::Queued);
        assert!(state.is_dirty(&k) && state.is_queued(&k));
        assert_eq!(state.admit(job(k.clone())), Admission::AlreadyQueued);
        assert_eq!(state.queue_len(), 1);

        let ready = state.take_ready(10);
        assert_eq!(ready.len(), 1);
        assert!(state.is_in_progress(&k));
        assert!(!state.is_queued(&k));
        assert!(!state.is_dirty(&k));
    }

    #[test]
    fn test_take_respects_limit() {
        let mut state = State::default();
        for name in ["a", "b", "c"] {
            state.admit(job(key(name)));
        }

        assert_eq!(state.take_ready(2).len(), 2);
        assert_eq!(state.take_ready(2).len(), 0);
        assert_eq!(state.in_progress_len(), 2);
        assert_eq!(state.queue_len(), 1);
    }

    #[test]
    fn test_deploys_while_running_requeue_once() {
        let mut state = State::default();
        let k = key("c1");
        state.admit(job(k.clone()));
        let running = state.take_ready(1).remove(0);

        assert_eq!(state.admit(job(k.clone())), Admission::MarkedDirty);
        assert_eq!(state.admit(job(k.clone())), Admission::MarkedDirty);
        assert_eq!(state.queue_len(), 0);

        assert!(state.complete(running, None));
        assert_eq!(state.queue_len(), 1);
        assert!(state.is_queued(&k) && state.is_dirty(&k));
        assert!(state.result(&k).is_none());
    }

    #[test]
    fn test_completion_stores_result() {
        let mut state = State::default();
        let k = key("c1");
        state.admit(job(k.clone()));
        let running = state.take_ready(1).remove(0);

        assert!(!state.complete(running, Some(anyhow::anyhow!("boom"))));
        assert!(!state.is_in_progress(&k));
        let stored = state.result(&k).unwrap();
        assert_eq!(stored.as_ref().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_new_deploy_discards_stale_result() {
        let mut state = State::default();
        let k = key("c1");
        state.admit(job(k.clone()));
        let running = state.take_ready(1).remove(0);
        state.complete(running, None);
        assert!(state.result(&k).is_some());

        state.admit(job(k.clone()));
        assert!(state.result(&k).is_none());
    }

    #[test]
    fn test_cleanup_keeps_in_progress() {
        let mut state = State::default();
        let k = key("c1");
        state.admit(job(k.clone()));
        let running = state.take_ready(1).remove(0);
        state.admit(job(k.clone()));

        state.cleanup(&k);

        assert!(state.is_in_progress(&k));
        assert!(!state.is_dirty(&k));
        assert!(!state.complete(running, None));
        assert_eq!(state.queue_len(), 0);
    }

    #[test]
    fn test_cleanup_drops_queued_job() {
        let mut state = State::default();
        let (a, b) = (key("a"), key("b"));
        state.admit(job(a.clone()));
        state.admit(job(b.clone()));

        state.cleanup(&a);

        assert!(!state.is_queued(&a));
        assert_eq!(state.take_ready(10)[0].key, b);
    }
}
