//! Drift exclusions.
//!
//! A drift exclusion names fields of selected resources that another
//! controller legitimately manages (an autoscaler owning `spec.replicas`, for
//! example). Each excluded path becomes a JSON6902 `remove` patch that is
//! applied to the proposed document before a redeploy, so those fields are
//! never clobbered.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;
use crate::error::{DeployerError, Result};

/// Selects the resources a patch applies to. Unset fields match everything.
///
/// `name` and `namespace` are anchored regular expressions; the label and
/// annotation selectors are comma-separated `key=value` (or bare `key`)
/// requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<String>,
}

impl PatchSelector {
    #[must_use]
    pub fn kind(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            ..Self::default()
        }
    }

    /// Whether the document is selected
    pub fn matches(&self, document: &Document) -> Result<bool> {
        let gvk = document.gvk();
        let exact = |wanted: &Option<String>, actual: &str| {
            wanted.as_deref().map_or(true, |w| w == actual)
        };
        if !exact(&self.group, &gvk.group)
            || !exact(&self.version, &gvk.version)
            || !exact(&self.kind, &gvk.kind)
        {
            return Ok(false);
        }

        if !pattern_matches(self.name.as_deref(), document.name())?
            || !pattern_matches(self.namespace.as_deref(), document.namespace())?
        {
            return Ok(false);
        }

        Ok(
            requirements_match(self.label_selector.as_deref(), &document.labels())
                && requirements_match(
                    self.annotation_selector.as_deref(),
                    &document.annotations(),
                ),
        )
    }
}

/// Field paths to leave alone on redeploy, optionally scoped to some resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftExclusion {
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PatchSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOperation {
    Remove,
}

/// A single-operation JSON6902 patch scoped by a selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub target: Option<PatchSelector>,
    pub op: PatchOperation,
    /// JSON pointer of the field
    pub path: String,
}

impl Patch {
    /// Render the JSON6902 patch document
    #[must_use]
    pub fn to_json6902(&self) -> String {
        serde_json::json!([{ "op": self.op, "path": self.path }]).to_string()
    }

    pub fn applies_to(&self, document: &Document) -> Result<bool> {
        match &self.target {
            Some(selector) => selector.matches(document),
            None => Ok(true),
        }
    }

    /// Apply the patch; returns whether anything was removed.
    ///
    /// Removing a path that does not exist is not an error.
    pub fn apply(&self, document: &mut Document) -> Result<bool> {
        let PatchOperation::Remove = self.op;
        let Some((parent, last)) = self.path.rsplit_once('/') else {
            return Err(DeployerError::InvalidSelector(format!(
                "patch path '{}' is not a JSON pointer",
                self.path
            )));
        };
        let last = unescape_segment(last);

        let map = document.as_map_mut();
        let container = if parent.is_empty() {
            None
        } else {
            let (root, rest) = split_root(parent);
            map.get_mut(&root)
                .and_then(|value| value.pointer_mut(&rest))
        };

        let removed = match container {
            None if parent.is_empty() => map.remove(&last).is_some(),
            None => false,
            Some(Value::Object(object)) => object.remove(&last).is_some(),
            Some(Value::Array(items)) => match last.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    items.remove(index);
                    true
                }
                _ => false,
            },
            Some(_) => false,
        };
        Ok(removed)
    }
}

/// Expand exclusions into one remove patch per path, in declaration order
#[must_use]
pub fn transform_drift_exclusions_to_patches(exclusions: &[DriftExclusion]) -> Vec<Patch> {
    exclusions
        .iter()
        .flat_map(|exclusion| {
            exclusion.paths.iter().map(|path| Patch {
                target: exclusion.target.clone(),
                op: PatchOperation::Remove,
                path: to_pointer(path),
            })
        })
        .collect()
}

/// Apply every patch that selects the document; returns how many removed a field
pub fn apply_patches(document: &mut Document, patches: &[Patch]) -> Result<usize> {
    let mut removed = 0;
    for patch in patches {
        if patch.applies_to(document)? && patch.apply(document)? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Accept both JSON pointers (`/spec/replicas`) and dotted paths (`spec.replicas`)
fn to_pointer(path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

/// Split `/a/b/c` into `a` and the pointer `/b/c`
fn split_root(pointer: &str) -> (String, String) {
    let trimmed = pointer.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((root, rest)) => (unescape_segment(root), format!("/{rest}")),
        None => (unescape_segment(trimmed), String::new()),
    }
}

fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

fn pattern_matches(pattern: Option<&str>, value: &str) -> Result<bool> {
    let Some(pattern) = pattern else {
        return Ok(true);
    };
    let regex = Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| DeployerError::InvalidSelector(format!("{pattern}: {e}")))?;
    Ok(regex.is_match(value))
}

fn requirements_match(
    selector: Option<&str>,
    values: &std::collections::BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector
        .split(',')
        .map(str::trim)
        .filter(|requirement| !requirement.is_empty())
        .all(|requirement| match requirement.split_once('=') {
            Some((key, value)) => values.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => values.contains_key(requirement),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str) -> Document {
        Document::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "web", "labels": {"team": "edge"}},
            "spec": {
                "replicas": 3,
                "template": {"spec": {"containers": [{"name": "a"}, {"name": "b"}]}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_one_patch_per_path() {
        let exclusions = vec![
            DriftExclusion {
                paths: vec!["/spec/replicas".into(), "spec.paused".into()],
                target: Some(PatchSelector::kind("Deployment")),
            },
            DriftExclusion {
                paths: vec!["/metadata/labels".into()],
                target: None,
            },
        ];

        let patches = transform_drift_exclusions_to_patches(&exclusions);

        assert_eq!(patches.len(), 3);
        assert!(patches.iter().all(|p| p.op == PatchOperation::Remove));
        assert_eq!(patches[0].path, "/spec/replicas");
        assert_eq!(patches[1].path, "/spec/paused");
        assert_eq!(patches[1].target, Some(PatchSelector::kind("Deployment")));
        assert_eq!(patches[2].path, "/metadata/labels");
        assert!(patches[2].target.is_none());
    }

    #[test]
    fn test_empty_exclusions_produce_no_patches() {
        assert!(transform_drift_exclusions_to_patches(&[]).is_empty());
        let empty = DriftExclusion::default();
        assert!(transform_drift_exclusions_to_patches(&[empty]).is_empty());
    }

    #[test]
    fn test_json6902_rendering() {
        let patch = &transform_drift_exclusions_to_patches(&[DriftExclusion {
            paths: vec!["/spec/replicas".into()],
            target: None,
        }])[0];
        assert_eq!(
            patch.to_json6902(),
            r#"[{"op":"remove","path":"/spec/replicas"}]"#
        );
    }

    #[test]
    fn test_apply_removes_selected_field() {
        let patches = transform_drift_exclusions_to_patches(&[DriftExclusion {
            paths: vec!["/spec/replicas".into(), "/spec/template/spec/containers/1".into()],
            target: Some(PatchSelector::kind("Deployment")),
        }]);
        let mut doc = deployment("nginx");

        assert_eq!(apply_patches(&mut doc, &patches).unwrap(), 2);
        assert!(doc.field(&["spec", "replicas"]).is_none());
        assert_eq!(
            doc.field(&["spec", "template", "spec", "containers"]),
            Some(&json!([{"name": "a"}]))
        );
    }

    #[test]
    fn test_missing_path_is_ignored() {
        let patches = transform_drift_exclusions_to_patches(&[DriftExclusion {
            paths: vec!["/spec/notThere".into(), "/status/replicas".into()],
            target: None,
        }]);
        let mut doc = deployment("nginx");
        assert_eq!(apply_patches(&mut doc, &patches).unwrap(), 0);
        assert_eq!(doc, deployment("nginx"));
    }

    #[test]
    fn test_selector_filters_resources() {
        let selector = PatchSelector {
            kind: Some("Deployment".into()),
            name: Some("ng.*".into()),
            namespace: Some("web".into()),
            label_selector: Some("team=edge".into()),
            ..PatchSelector::default()
        };

        assert!(selector.matches(&deployment("nginx")).unwrap());
        assert!(!selector.matches(&deployment("api")).unwrap());
        assert!(!PatchSelector::kind("Service")
            .matches(&deployment("nginx"))
            .unwrap());

        let other_team = PatchSelector {
            label_selector: Some("team=core".into()),
            ..PatchSelector::default()
        };
        assert!(!other_team.matches(&deployment("nginx")).unwrap());
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        let selector = PatchSelector {
            name: Some("(".into()),
            ..PatchSelector::default()
        };
        assert!(matches!(
            selector.matches(&deployment("nginx")),
            Err(DeployerError::InvalidSelector(_))
        ));
    }
}
