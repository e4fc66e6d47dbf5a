//! Narrow interfaces to the external systems a phase depends on.
//!
//! The phases never talk to the plan controller, the metadata service, the
//! image repository, the routing-tier management API or the compute-zone
//! transport directly. Each is reached through one of these traits so the
//! engine can be driven by real clients in production and in-memory fakes
//! in tests.

use crate::errors::RemoteError;
use crate::plan::{Application, Artifact, ArtifactFilter, Instance, Plan, ShardIndexMap};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Exit status and captured output of a remote script.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// The outer workflow controller: plan identity, output properties,
/// completion reporting and pause signalling.
#[async_trait]
pub trait PlanControl: Send + Sync {
    fn plan(&self) -> Plan;

    async fn persist_output_property(&self, key: &str, value: &str) -> Result<()>;

    async fn report_finished(&self);

    async fn report_retry(&self, error: String);

    async fn report_hold(&self, error: String);

    /// Whether the controller has asked the running phase to pause.
    fn check_pause(&self) -> bool;
}

/// The application configuration service.
#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn get_application(&self) -> Result<Application>;
}

/// The artifact (image) repository.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>>;

    async fn get_artifact(&self, id: &str) -> Result<Artifact>;
}

/// Management interface for routing-tier instances.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    async fn list_instances(&self, service: &str) -> Result<BTreeMap<String, Instance>>;

    async fn restart_instance(&self, instance_id: &str) -> Result<()>;

    async fn shard_index_map(&self, instance_id: &str) -> Result<ShardIndexMap>;
}

/// Runs a rendered script on a named remote execution target.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute_remote(&self, target: &str, script: &str) -> Result<ExecOutput, RemoteError>;
}

/// Hierarchical, human-facing status display.
///
/// Implementations decide how lines are rendered; phases only ever append
/// or replace text on the node they hold.
pub trait StatusSink: Send + Sync {
    /// Replace this node's text.
    fn update(&self, message: &str);

    /// Attach a `name: value` property to this node.
    fn prop(&self, name: &str, value: &str);

    /// Remove all children of this node.
    fn trunc(&self);

    /// Remove this node's text, properties and children.
    fn clear(&self);

    /// Create a new child node beneath this one.
    fn child(&self) -> Arc<dyn StatusSink>;
}

/// Every collaborator a phase needs, bundled for threading through steps.
#[derive(Clone)]
pub struct Collaborators {
    pub control: Arc<dyn PlanControl>,
    pub metadata: Arc<dyn MetadataService>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub instances: Arc<dyn InstanceManager>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub status: Arc<dyn StatusSink>,
}
