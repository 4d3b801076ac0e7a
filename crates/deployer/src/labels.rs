//! Provenance labels and ownership annotations stamped on deployed resources.

use crate::conflict::{ProfileRef, ReferenceRef, Tier};
use crate::document::Document;
use crate::error::Result;
use crate::hash::compute_policy_hash;

/// Kind of the source object (ConfigMap, Secret, ...) a resource came from
pub const REFERENCE_KIND_LABEL: &str = "projectsveltos.io/reference-kind";

/// Name of the source object a resource came from
pub const REFERENCE_NAME_LABEL: &str = "projectsveltos.io/reference-name";

/// Namespace of the source object a resource came from
pub const REFERENCE_NAMESPACE_LABEL: &str = "projectsveltos.io/reference-namespace";

/// Kind of the profile currently owning a resource
pub const OWNER_KIND_ANNOTATION: &str = "projectsveltos.io/owner-kind";

/// Name of the profile currently owning a resource
pub const OWNER_NAME_ANNOTATION: &str = "projectsveltos.io/owner-name";

/// Tier of the profile currently owning a resource
pub const OWNER_TIER_ANNOTATION: &str = "projectsveltos.io/owner-tier";

/// Content hash of the resource as last deployed
pub const HASH_ANNOTATION: &str = "projectsveltos.io/hash";

const PROVENANCE_LABELS: [&str; 3] = [
    REFERENCE_KIND_LABEL,
    REFERENCE_NAME_LABEL,
    REFERENCE_NAMESPACE_LABEL,
];

const OWNERSHIP_ANNOTATIONS: [&str; 4] = [
    OWNER_KIND_ANNOTATION,
    OWNER_NAME_ANNOTATION,
    OWNER_TIER_ANNOTATION,
    HASH_ANNOTATION,
];

/// Whether the resource was created by this system
#[must_use]
pub fn has_provenance(document: &Document) -> bool {
    document.label(REFERENCE_KIND_LABEL).is_some()
}

/// Stamp provenance, ownership and content hash onto a document about to be deployed.
///
/// The hash is computed last so it covers every other label and annotation.
pub fn mark_deployed(
    document: &mut Document,
    reference: &ReferenceRef,
    profile: &ProfileRef,
    tier: Tier,
) -> Result<String> {
    document.set_label(REFERENCE_KIND_LABEL, &reference.kind);
    document.set_label(REFERENCE_NAME_LABEL, &reference.name);
    document.set_label(REFERENCE_NAMESPACE_LABEL, &reference.namespace);
    document.set_annotation(OWNER_KIND_ANNOTATION, &profile.kind);
    document.set_annotation(OWNER_NAME_ANNOTATION, &profile.name);
    document.set_annotation(OWNER_TIER_ANNOTATION, &tier.to_string());

    let hash = compute_policy_hash(document)?;
    document.set_annotation(HASH_ANNOTATION, &hash);
    Ok(hash)
}

/// Remove every provenance label and ownership annotation
pub fn strip_management_metadata(document: &mut Document) {
    for label in PROVENANCE_LABELS {
        document.remove_label(label);
    }
    for annotation in OWNERSHIP_ANNOTATIONS {
        document.remove_annotation(annotation);
    }
}
