//! Canonical content hashing and human-readable diffs of resource documents.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use similar::TextDiff;

use crate::document::Document;
use crate::error::Result;
use crate::labels::HASH_ANNOTATION;

const HASH_PREFIX: &str = "sha256:";

/// Hash a document independently of map key order and of any stale hash annotation.
///
/// Arrays keep their order; only object keys are sorted.
pub fn compute_policy_hash(document: &Document) -> Result<String> {
    let mut stripped = document.clone();
    stripped.remove_annotation(HASH_ANNOTATION);

    let canonical = canonicalize(&stripped.into_value());
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);

    Ok(format!("{HASH_PREFIX}{}", hex::encode(digest)))
}

/// Unified diff between the deployed and the proposed version of a document.
///
/// Server-managed bookkeeping (`managedFields`, `generation`, `status`) and the
/// hash annotation are ignored. Used for reports only.
pub fn evaluate_resource_diff(from: &Document, to: &Document) -> Result<String> {
    let from_text = diffable_yaml(from)?;
    let to_text = diffable_yaml(to)?;

    let diff = TextDiff::from_lines(&from_text, &to_text);
    Ok(diff
        .unified_diff()
        .context_radius(3)
        .header("deployed", "proposed")
        .to_string())
}

fn diffable_yaml(document: &Document) -> Result<String> {
    let mut doc = document.clone();
    doc.remove_annotation(HASH_ANNOTATION);

    let map = doc.as_map_mut();
    map.remove("status");
    if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
        metadata.remove("managedFields");
        metadata.remove("generation");
    }

    Ok(serde_yaml::to_string(&canonicalize(&doc.into_value()))?)
}

/// Rebuild a value so every object level has sorted keys
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = doc(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "n"},
            "data": {"x": "1", "y": "2"}
        }));
        let b = doc(json!({
            "data": {"y": "2", "x": "1"},
            "metadata": {"namespace": "n", "name": "a"},
            "kind": "ConfigMap",
            "apiVersion": "v1"
        }));

        assert_eq!(
            compute_policy_hash(&a).unwrap(),
            compute_policy_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_hash_ignores_stale_hash_annotation() {
        let plain = doc(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}));
        let mut annotated = plain.clone();
        annotated.set_annotation(HASH_ANNOTATION, "sha256:old");

        assert_eq!(
            compute_policy_hash(&plain).unwrap(),
            compute_policy_hash(&annotated).unwrap()
        );
    }

    #[test]
    fn test_hash_changes_with_leaf_value() {
        let a = doc(json!({"kind": "ConfigMap", "data": {"x": "1"}}));
        let b = doc(json!({"kind": "ConfigMap", "data": {"x": "2"}}));
        assert_ne!(
            compute_policy_hash(&a).unwrap(),
            compute_policy_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_hash_preserves_array_order() {
        let a = doc(json!({"kind": "X", "items": [1, 2]}));
        let b = doc(json!({"kind": "X", "items": [2, 1]}));
        assert_ne!(
            compute_policy_hash(&a).unwrap(),
            compute_policy_hash(&b).unwrap()
        );
    }

    #[test]
    fn test_hash_format() {
        let hash = compute_policy_hash(&doc(json!({"kind": "X"}))).unwrap();
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_diff_ignores_server_fields() {
        let deployed = doc(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "generation": 7,
                "managedFields": [{"manager": "kubectl"}],
                "annotations": {"projectsveltos.io/hash": "sha256:aaa"}
            },
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        }));
        let proposed = doc(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "annotations": {"projectsveltos.io/hash": "sha256:bbb"}
            },
            "spec": {"replicas": 2}
        }));

        assert!(evaluate_resource_diff(&deployed, &proposed).unwrap().is_empty());
    }

    #[test]
    fn test_diff_shows_changed_lines() {
        let deployed = doc(json!({"kind": "Deployment", "spec": {"replicas": 2}}));
        let proposed = doc(json!({"kind": "Deployment", "spec": {"replicas": 5}}));

        let diff = evaluate_resource_diff(&deployed, &proposed).unwrap();
        assert!(diff.contains("--- deployed"));
        assert!(diff.contains("+++ proposed"));
        assert!(diff.contains("-  replicas: 2"));
        assert!(diff.contains("+  replicas: 5"));
    }
}
