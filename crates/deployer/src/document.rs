//! Resource document model.
//!
//! Remote resources of any kind are carried as a [`Document`]: an
//! insertion-ordered map of field name to JSON value. The handful of fields
//! the coordination engine reasons about (identity, labels, annotations,
//! owner references, resource version) get typed accessors; everything else
//! passes through untouched.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DeployerError, Result};

/// Group, version and kind of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Build from an `apiVersion` string (`group/version` or just `version`)
    #[must_use]
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// The `apiVersion` string for this group/version
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identity of a resource inside one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    #[must_use]
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(&self.group, &self.version, &self.kind)
    }

    /// Namespace, or `None` for cluster-scoped resources
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}:{}", self.kind, self.name)
        } else {
            write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A resource document of arbitrary kind
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a document from a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DeployerError::InvalidDocument(format!(
                "expected an object, found {}",
                value_type(&other)
            ))),
        }
    }

    /// Parse a single YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Look up a nested field by path segments
    #[must_use]
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for segment in rest {
            current = current.as_object()?.get(*segment)?;
        }
        Some(current)
    }

    #[must_use]
    pub fn api_version(&self) -> &str {
        self.str_field("apiVersion")
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        self.str_field("kind")
    }

    #[must_use]
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(self.api_version(), self.kind())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata_str("name")
    }

    /// Namespace, empty for cluster-scoped resources
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace")
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    #[must_use]
    pub fn identity(&self) -> ResourceIdentity {
        let gvk = self.gvk();
        ResourceIdentity {
            group: gvk.group,
            version: gvk.version,
            kind: gvk.kind,
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }

    /// Ensure the fields every managed resource needs are present
    pub fn validate(&self) -> Result<()> {
        if self.api_version().is_empty() {
            return Err(DeployerError::InvalidDocument("missing apiVersion".into()));
        }
        if self.kind().is_empty() {
            return Err(DeployerError::InvalidDocument("missing kind".into()));
        }
        if self.name().is_empty() {
            return Err(DeployerError::InvalidDocument(format!(
                "{} has no metadata.name",
                self.kind()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.field(&["metadata", "labels", key])?.as_str()
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.set_string_map_entry("labels", key, value);
    }

    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        self.remove_string_map_entry("labels", key)
    }

    #[must_use]
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.field(&["metadata", "annotations", key])?.as_str()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set_string_map_entry("annotations", key, value);
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        self.remove_string_map_entry("annotations", key)
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.field(&["metadata", "resourceVersion"])?.as_str()
    }

    pub fn set_resource_version(&mut self, version: &str) {
        self.metadata_mut().insert(
            "resourceVersion".to_string(),
            Value::String(version.to_string()),
        );
    }

    pub fn clear_resource_version(&mut self) {
        self.metadata_mut().remove("resourceVersion");
    }

    /// Owner references; entries that do not parse are skipped
    #[must_use]
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.field(&["metadata", "ownerReferences"])
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn str_field(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn metadata_str(&self, key: &str) -> &str {
        self.field(&["metadata", key])
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let metadata = self
            .0
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        match metadata {
            Value::Object(map) => map,
            _ => unreachable!("metadata was just normalized to an object"),
        }
    }

    fn string_map(&self, key: &str) -> BTreeMap<String, String> {
        self.field(&["metadata", key])
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_string_map_entry(&mut self, map_key: &str, key: &str, value: &str) {
        let entry = self
            .metadata_mut()
            .entry(map_key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    fn remove_string_map_entry(&mut self, map_key: &str, key: &str) -> Option<String> {
        let metadata = self.0.get_mut("metadata")?.as_object_mut()?;
        let map = metadata.get_mut(map_key)?.as_object_mut()?;
        let removed = map.remove(key)?;
        if map.is_empty() {
            metadata.remove(map_key);
        }
        removed.as_str().map(ToString::to_string)
    }
}

impl TryFrom<Value> for Document {
    type Error = DeployerError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
