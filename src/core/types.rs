//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for tasks, sites, and passes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique, stable name of a background task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskName(String);

/// Opaque tenant/site selector supplied by the trigger surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

/// Unique identifier for one pass over the task registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassId(Uuid);

impl TaskName {
    /// Create a new TaskName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl SiteId {
    /// Name of the site used when the caller does not select one.
    pub const DEFAULT: &'static str = "default";

    /// Create a new SiteId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SiteId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl PassId {
    /// Generate a new random PassId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a PassId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PassId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
