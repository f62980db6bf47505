use super::json_path;
use crate::{Result, RillError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateAction {
    /// Replaces the whole record value.
    Update,
    /// Merges a value into the record at a path.
    Patch,
}

/// Version a step wants to write. `Any` is resolved to `current + 1` when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum TargetVersion {
    Any,
    Exact(u64),
}

impl From<Option<u64>> for TargetVersion {
    fn from(version: Option<u64>) -> Self {
        match version {
            Some(version) => TargetVersion::Exact(version),
            None => TargetVersion::Any,
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetVersion::Any => f.write_str("any"),
            TargetVersion::Exact(version) => write!(f, "{}", version),
        }
    }
}

impl From<TargetVersion> for Option<u64> {
    fn from(version: TargetVersion) -> Self {
        match version {
            TargetVersion::Any => None,
            TargetVersion::Exact(version) => Some(version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStep {
    pub name: String,
    pub version: TargetVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub data: Value,
    #[serde(default)]
    pub is_write_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl UpdateStep {
    pub fn update(name: impl Into<String>, version: TargetVersion, data: Value) -> Self {
        Self {
            name: name.into(),
            version,
            path: None,
            data,
            is_write_ack: false,
            correlation_id: None,
        }
    }

    pub fn patch(
        name: impl Into<String>,
        version: TargetVersion,
        path: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::update(name, version, data)
        }
    }

    pub fn with_write_ack(mut self, correlation_id: impl Into<String>) -> Self {
        self.is_write_ack = true;
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn action(&self) -> UpdateAction {
        if self.path.is_some() {
            UpdateAction::Patch
        } else {
            UpdateAction::Update
        }
    }

    /// Whole-record updates must carry an object or an array; patches may
    /// carry any value but need a well-formed path.
    pub fn validate(&self) -> Result<()> {
        match &self.path {
            Some(path) => json_path::tokenize(path).map(|_| ()),
            None if self.data.is_object() || self.data.is_array() => Ok(()),
            None => Err(RillError::InvalidMessageData(format!(
                "update for {} must carry an object or an array",
                self.name
            ))),
        }
    }

    /// Copy of the step as broadcast to subscribers, without write-ack metadata.
    pub fn without_write_ack(&self) -> Self {
        Self {
            is_write_ack: false,
            correlation_id: None,
            ..self.clone()
        }
    }
}
