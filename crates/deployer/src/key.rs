//! Request key codec.
//!
//! A [`RequestKey`] identifies one unit of deployment work: the target
//! cluster, who asked for it, which feature is being deployed and whether the
//! work is a cleanup. Every field is folded into a single opaque string so the
//! scheduler can use it directly as a map key.
//!
//! Fields are joined with `::`. Any `:` or `%` inside a field is
//! percent-escaped first, so the encoding stays injective for arbitrary field
//! values, including the empty requester used by system-initiated deploys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DeployerError, Result};

const SEPARATOR: &str = "::";
const FIELD_COUNT: usize = 6;

/// Kind of cluster a deployment targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterKind {
    /// Cluster API managed cluster
    Capi,
    /// Cluster registered directly with the platform
    Sveltos,
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capi => write!(f, "Capi"),
            Self::Sveltos => write!(f, "Sveltos"),
        }
    }
}

impl FromStr for ClusterKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Capi" => Ok(Self::Capi),
            "Sveltos" => Ok(Self::Sveltos),
            other => Err(format!("unknown cluster kind '{other}'")),
        }
    }
}

/// Decoded fields of a request key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub requester: String,
    pub feature_id: String,
    pub cluster_kind: ClusterKind,
    pub cleanup: bool,
}

/// Opaque, immutable identifier of one unit of deployment work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Encode the key fields into a request key
    #[must_use]
    pub fn new(
        cluster_namespace: &str,
        cluster_name: &str,
        requester: &str,
        feature_id: &str,
        cluster_kind: ClusterKind,
        cleanup: bool,
    ) -> Self {
        let encoded = [
            escape(cluster_namespace),
            escape(cluster_name),
            escape(requester),
            escape(feature_id),
            cluster_kind.to_string(),
            cleanup.to_string(),
        ]
        .join(SEPARATOR);
        Self(encoded)
    }

    /// Parse and validate an encoded key
    pub fn parse(key: &str) -> Result<Self> {
        decode(key)?;
        Ok(Self(key.to_string()))
    }

    /// The encoded string form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All decoded fields
    pub fn fields(&self) -> Result<KeyFields> {
        decode(&self.0)
    }

    /// Cluster namespace and name
    pub fn cluster(&self) -> Result<(String, String)> {
        decode_cluster(&self.0)
    }

    /// Requester and feature id
    pub fn requester_and_feature(&self) -> Result<(String, String)> {
        decode_requester_and_feature(&self.0)
    }

    /// Whether this key describes a cleanup
    pub fn cleanup(&self) -> Result<bool> {
        decode_cleanup(&self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode the cluster namespace and name from an encoded key
pub fn decode_cluster(key: &str) -> Result<(String, String)> {
    let fields = decode(key)?;
    Ok((fields.cluster_namespace, fields.cluster_name))
}

/// Decode the requester and feature id from an encoded key
pub fn decode_requester_and_feature(key: &str) -> Result<(String, String)> {
    let fields = decode(key)?;
    Ok((fields.requester, fields.feature_id))
}

/// Decode the cleanup flag from an encoded key
pub fn decode_cleanup(key: &str) -> Result<bool> {
    Ok(decode(key)?.cleanup)
}

fn decode(key: &str) -> Result<KeyFields> {
    let parts: Vec<&str> = key.split(SEPARATOR).collect();
    if parts.len() != FIELD_COUNT {
        return Err(DeployerError::malformed_key(
            key,
            format!("expected {FIELD_COUNT} fields, found {}", parts.len()),
        ));
    }

    let cluster_kind = parts[4]
        .parse::<ClusterKind>()
        .map_err(|reason| DeployerError::malformed_key(key, reason))?;

    let cleanup = match parts[5] {
        "true" => true,
        "false" => false,
        other => {
            return Err(DeployerError::malformed_key(
                key,
                format!("invalid cleanup flag '{other}'"),
            ))
        }
    };

    Ok(KeyFields {
        cluster_namespace: unescape(key, parts[0])?,
        cluster_name: unescape(key, parts[1])?,
        requester: unescape(key, parts[2])?,
        feature_id: unescape(key, parts[3])?,
        cluster_kind,
        cleanup,
    })
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(key: &str, field: &str) -> Result<String> {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find(['%', ':']) {
        out.push_str(&rest[..pos]);
        if rest[pos..].starts_with(':') {
            return Err(DeployerError::malformed_key(key, "unescaped ':' in field"));
        }
        match rest.get(pos + 1..pos + 3) {
            Some("25") => out.push('%'),
            Some("3A") => out.push(':'),
            _ => {
                return Err(DeployerError::malformed_key(
                    key,
                    "invalid escape sequence in field",
                ))
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}
