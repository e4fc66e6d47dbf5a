//! Data model shared by the reshard phases.
//!
//! This module provides:
//! - `Plan`, the immutable identity of a resharding operation
//! - `Workspace`, the per-attempt working area on a remote target
//! - `Artifact` and `ArtifactFilter` for the image repository
//! - `Instance` and `ShardIndexMap` for the routing tier
//! - `Application`, the metadata record used to build script options

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use uuid::Uuid;

/// Identity of a resharding operation. Owned by the outer workflow controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier
    pub uuid: String,
    /// Shard being split
    pub shard: String,
    /// Shard receiving half of the vnodes
    pub new_shard: String,
}

impl Plan {
    pub fn new(uuid: impl Into<String>, shard: impl Into<String>, new_shard: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            shard: shard.into(),
            new_shard: new_shard.into(),
        }
    }

    /// Load a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file {}", path.display()))
    }

    /// Human-readable description of the transition this plan performs.
    pub fn transition(&self) -> String {
        format!(
            "split shard {} in half; create new shard {}",
            self.shard, self.new_shard
        )
    }
}

/// An ephemeral working area on a remote execution target.
///
/// Identifiers take the form `<plan-id>.<8 hex chars>` and are never reused
/// across attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
}

impl Workspace {
    /// Allocate a fresh workspace identifier for `plan`.
    pub fn allocate(plan: &Plan) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}.{}", plan.uuid, &suffix[..8]),
        }
    }
}

/// A versioned object in the artifact repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
}

impl Artifact {
    /// Whether this artifact carries `tag == value`. Untagged artifacts never match.
    pub fn has_tag(&self, tag: &str, value: &str) -> bool {
        self.tags
            .as_ref()
            .and_then(|tags| tags.get(tag))
            .is_some_and(|v| v == value)
    }
}

/// Server-side filter for listing artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFilter {
    pub name: String,
    pub owner: String,
}

/// One entry in an instance's shard index map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    #[serde(rename = "readOnly")]
    pub read_only: bool,
}

/// Shard identifier → entry, as reported by a routing-tier instance.
pub type ShardIndexMap = BTreeMap<String, ShardEntry>;

/// A running routing-tier instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: String,
    pub service: String,
}

/// Application configuration record from the metadata service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub owner_uuid: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Application {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Whether `value` is a hyphenated UUID, the format the repository uses for ids.
pub fn is_uuid(value: &str) -> bool {
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}
