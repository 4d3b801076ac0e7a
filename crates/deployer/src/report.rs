//! Per-resource deployment reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::ResourceIdentity;

/// What a deployment did, or in dry-run would do, to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportAction {
    Create,
    Update,
    NoAction,
    Conflict,
    Delete,
}

impl fmt::Display for ReportAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::NoAction => "No Action",
            Self::Conflict => "Conflict",
            Self::Delete => "Delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub resource: ResourceIdentity,
    pub action: ReportAction,
    /// Conflict explanation, or the diff for a dry-run update
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ResourceReport {
    #[must_use]
    pub fn new(resource: ResourceIdentity, action: ReportAction) -> Self {
        Self {
            resource,
            action,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl fmt::Display for ResourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.resource)
    }
}
