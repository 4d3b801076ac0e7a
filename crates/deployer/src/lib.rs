/*
 * 5D Labs Agent Platform - Add-on Deployment Coordination
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Deployment coordination engine for multi-cluster add-on delivery.
//!
//! Many profile controllers push manifests into many remote clusters at the
//! same time, and more than one profile may legitimately want to manage the
//! same object. This crate provides the pieces that keep that safe:
//!
//! - [`scheduler`]: a dedup job queue and worker pool that runs at most one
//!   apply per (cluster, requester, feature) key and converges to the latest
//!   request under churn
//! - [`conflict`]: the ownership protocol deciding whether a requester may
//!   mutate an object that already exists in a cluster, including tier-based
//!   preemption
//! - [`apply`]: optimistic-concurrency writes with dry-run and drift
//!   exclusions
//! - [`cleanup`]: removal or detachment of resources a profile no longer wants
//! - [`hash`]: canonical content hashing and human-readable diffs
//! - [`drift`]: drift exclusions expanded into remove patches
//!
//! The remote cluster is reached through the [`store::ObjectStore`] trait;
//! [`store::kube::KubeStore`] talks to a real API server and
//! [`store::memory::InMemoryStore`] is a faithful in-process fake.

pub mod apply;
pub mod cleanup;
pub mod config;
pub mod conflict;
pub mod deploy;
pub mod document;
pub mod drift;
pub mod error;
pub mod hash;
pub mod key;
pub mod labels;
pub mod probe;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use apply::ResourceApplier;
pub use cleanup::{SkipAnnotation, StaleResourceCleaner};
pub use config::DeployerConfig;
pub use conflict::{
    can_deploy_resource, can_deploy_resource_with_default, validate_object_for_update,
    ConflictError, ProfileRef, ReferenceRef, ResourceInfo, Tier,
};
pub use deploy::{DeploymentOutcome, DeploymentRequest, ManifestDeployer, DEFAULT_NAMESPACE};
pub use document::{Document, GroupVersionKind, ResourceIdentity};
pub use drift::{transform_drift_exclusions_to_patches, DriftExclusion, Patch, PatchSelector};
pub use error::{DeployerError, Result};
pub use hash::{compute_policy_hash, evaluate_resource_diff};
pub use key::{ClusterKind, RequestKey};
pub use probe::CrdProbe;
pub use report::{ReportAction, ResourceReport};
pub use retry::RetryPolicy;
pub use scheduler::{DeployOptions, DeployResult, ResultStatus, Scheduler};
pub use store::{ObjectStore, StoreError};
