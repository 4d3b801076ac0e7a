//! # Ownership Conflict Resolution
//!
//! Several profiles may want to manage the same resource in the same cluster.
//! Before anything is written, the resource currently in the cluster is
//! inspected:
//!
//! - **Provenance**: the reference labels record which source object
//!   (ConfigMap, Secret, ...) produced the resource. A different source is
//!   always a conflict.
//! - **Ownership**: the owner annotations record which profile deployed it.
//!   A different profile is a conflict; a resource without owner annotations
//!   is adoptable.
//! - **Tier**: on conflict, a requester with a numerically lower tier than
//!   the recorded owner takes the resource over, and the dispossessed
//!   profile must be reconciled again.
//!
//! Everything here is read-only against the store so it can run from dry-run
//! paths as often as needed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::document::Document;
use crate::error::{DeployerError, Result};
use crate::labels::{
    HASH_ANNOTATION, OWNER_KIND_ANNOTATION, OWNER_NAME_ANNOTATION, OWNER_TIER_ANNOTATION,
    REFERENCE_KIND_LABEL, REFERENCE_NAMESPACE_LABEL, REFERENCE_NAME_LABEL,
};
use crate::store::ObjectStore;

/// Source object (ConfigMap, Secret, ...) whose content produced a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ReferenceRef {
    #[must_use]
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ReferenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Profile that owns (or wants to own) a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileRef {
    pub kind: String,
    pub name: String,
}

impl ProfileRef {
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ProfileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Profile priority. Lower values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tier(u32);

impl Tier {
    /// Tier of profiles that never declared one
    pub const DEFAULT: Tier = Tier(100);

    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether this tier takes precedence over `other`. Equal tiers never do.
    #[must_use]
    pub fn outranks(self, other: Tier) -> bool {
        self.0 < other.0
    }
}

impl Default for Tier {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tier {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Self)
    }
}

/// Another owner holds the resource
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConflictError {
    pub message: String,
    /// Profile currently owning the resource, when recorded
    pub current_owner: Option<ProfileRef>,
}

/// What the conflict check learned about the resource in the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub current: Document,
    /// Recorded owner tier, empty when none was recorded
    pub owner_tier: String,
    /// Recorded content hash, empty when none was recorded
    pub hash: String,
}

impl ResourceInfo {
    /// Recorded owner tier, falling back to the default tier
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier_or(Tier::DEFAULT)
    }

    /// Recorded owner tier, or `fallback` when it is missing or unparseable
    #[must_use]
    pub fn tier_or(&self, fallback: Tier) -> Tier {
        self.owner_tier.parse().unwrap_or(fallback)
    }

    /// Profile recorded in the owner annotations
    #[must_use]
    pub fn owner(&self) -> Option<ProfileRef> {
        recorded_owner(&self.current)
    }
}

/// Check whether `profile` may create or update `proposed` in the cluster.
///
/// Returns `Ok(None)` when the resource does not exist yet (a create).
#[instrument(skip_all, fields(resource = %proposed.identity(), profile = %profile))]
pub async fn validate_object_for_update(
    store: &dyn ObjectStore,
    proposed: &Document,
    reference: &ReferenceRef,
    profile: &ProfileRef,
) -> Result<Option<ResourceInfo>> {
    let (info, conflict) = inspect(store, proposed, reference, profile).await?;
    match conflict {
        Some(err) => Err(err.into()),
        None => Ok(info),
    }
}

/// Like [`validate_object_for_update`], resolving conflicts by tier.
///
/// On a conflict the requester wins only if its tier outranks the recorded
/// owner tier. The returned flag is then `true`, and the caller must trigger
/// a reconciliation of the previous owner so it notices the loss.
pub async fn can_deploy_resource(
    store: &dyn ObjectStore,
    proposed: &Document,
    reference: &ReferenceRef,
    profile: &ProfileRef,
    tier: Tier,
) -> Result<(Option<ResourceInfo>, bool)> {
    can_deploy_resource_with_default(store, proposed, reference, profile, tier, Tier::DEFAULT)
        .await
}

/// [`can_deploy_resource`] where an owner without a readable tier counts as
/// `default_tier`
#[instrument(skip_all, fields(resource = %proposed.identity(), profile = %profile, tier = %tier))]
pub async fn can_deploy_resource_with_default(
    store: &dyn ObjectStore,
    proposed: &Document,
    reference: &ReferenceRef,
    profile: &ProfileRef,
    tier: Tier,
    default_tier: Tier,
) -> Result<(Option<ResourceInfo>, bool)> {
    let (info, conflict) = inspect(store, proposed, reference, profile).await?;
    let Some(conflict) = conflict else {
        return Ok((info, false));
    };

    let owner_tier = info
        .as_ref()
        .map_or(default_tier, |info| info.tier_or(default_tier));
    if tier.outranks(owner_tier) {
        info!(
            owner = ?conflict.current_owner,
            owner_tier = %owner_tier,
            "Requester tier outranks current owner, taking ownership"
        );
        return Ok((info, true));
    }

    debug!(owner_tier = %owner_tier, "Conflict stands");
    Err(DeployerError::Conflict(conflict))
}

async fn inspect(
    store: &dyn ObjectStore,
    proposed: &Document,
    reference: &ReferenceRef,
    profile: &ProfileRef,
) -> Result<(Option<ResourceInfo>, Option<ConflictError>)> {
    let identity = proposed.identity();
    let Some(current) = store
        .get(&identity.gvk(), identity.namespace(), &identity.name)
        .await?
    else {
        debug!("Resource not present, no conflict");
        return Ok((None, None));
    };

    let info = ResourceInfo {
        owner_tier: current
            .annotation(OWNER_TIER_ANNOTATION)
            .unwrap_or_default()
            .to_string(),
        hash: current
            .annotation(HASH_ANNOTATION)
            .unwrap_or_default()
            .to_string(),
        current,
    };

    let conflict = reference_conflict(&info.current, reference)
        .or_else(|| owner_conflict(&info.current, profile));

    Ok((Some(info), conflict))
}

fn reference_conflict(current: &Document, reference: &ReferenceRef) -> Option<ConflictError> {
    let kind = current.label(REFERENCE_KIND_LABEL)?;
    let namespace = current.label(REFERENCE_NAMESPACE_LABEL).unwrap_or_default();
    let name = current.label(REFERENCE_NAME_LABEL).unwrap_or_default();

    if kind == reference.kind && namespace == reference.namespace && name == reference.name {
        return None;
    }

    Some(ConflictError {
        message: format!(
            "A conflict was detected while deploying resource {}. \
             This resource is currently deployed because of {kind} {namespace}/{name}",
            current.identity()
        ),
        current_owner: recorded_owner(current),
    })
}

fn owner_conflict(current: &Document, profile: &ProfileRef) -> Option<ConflictError> {
    let owner = recorded_owner(current)?;
    if &owner == profile {
        return None;
    }

    Some(ConflictError {
        message: format!(
            "A conflict was detected while deploying resource {}. \
             This resource is currently managed by {owner}",
            current.identity()
        ),
        current_owner: Some(owner),
    })
}

fn recorded_owner(document: &Document) -> Option<ProfileRef> {
    let name = document.annotation(OWNER_NAME_ANNOTATION)?;
    let kind = document.annotation(OWNER_KIND_ANNOTATION).unwrap_or_default();
    Some(ProfileRef::new(kind, name))
}
