//! In-memory collaborators for unit tests.

use crate::collaborators::{
    ArtifactRepository, ExecOutput, InstanceManager, MetadataService, PlanControl,
    RemoteExecutor, StatusSink,
};
use crate::errors::RemoteError;
use crate::plan::{
    Application, Artifact, ArtifactFilter, Instance, Plan, ShardEntry, ShardIndexMap,
};
use crate::progress::{ProgressHub, ProgressMessage};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

pub const PLAN_UUID: &str = "5d1c6f3e-8a2b-4c7d-9e0f-1a2b3c4d5e6f";
pub const OWNER_UUID: &str = "930896af-bf8c-48d4-885c-6573a94b1853";
pub const OLD_IMAGE: &str = "0f0e0d0c-0b0a-4909-8807-060504030201";
pub const NEW_IMAGE: &str = "11111111-2222-4333-8444-555555555555";

pub fn test_plan() -> Plan {
    Plan::new(PLAN_UUID, "3", "3b")
}

pub fn test_application() -> Application {
    Application {
        owner_uuid: OWNER_UUID.to_string(),
        metadata: HashMap::from([
            (
                "HASH_RING_IMGAPI_SERVICE".to_string(),
                "imgapi.test.example.com".to_string(),
            ),
            ("HASH_RING_IMAGE".to_string(), OLD_IMAGE.to_string()),
        ]),
    }
}

pub fn plan_artifact(uuid: &str, plan: &str) -> Artifact {
    Artifact {
        uuid: uuid.to_string(),
        name: "manta-hash-ring".to_string(),
        owner: OWNER_UUID.to_string(),
        tags: Some(HashMap::from([(
            "manta_reshard_plan".to_string(),
            plan.to_string(),
        )])),
    }
}

// ── status ──────────────────────────────────────────────────────────────

/// Status sink that records every update from every node in one log.
pub struct RecordingStatus {
    lines: Arc<Mutex<Vec<String>>>,
    props: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            props: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn props(&self) -> Vec<(String, String)> {
        self.props.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingStatus {
    fn update(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }

    fn prop(&self, name: &str, value: &str) {
        self.props
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    fn trunc(&self) {}

    fn clear(&self) {}

    fn child(&self) -> Arc<dyn StatusSink> {
        Arc::new(RecordingStatus {
            lines: self.lines.clone(),
            props: self.props.clone(),
        })
    }
}

// ── plan control ────────────────────────────────────────────────────────

pub struct FakeControl {
    plan: Plan,
    props: Mutex<Vec<(String, String)>>,
    finished: AtomicU32,
    retries: Mutex<Vec<String>>,
    holds: Mutex<Vec<String>>,
    pause_checks: AtomicU32,
    pause_after: Option<u32>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::with_plan(test_plan())
    }

    pub fn with_plan(plan: Plan) -> Self {
        Self {
            plan,
            props: Mutex::new(Vec::new()),
            finished: AtomicU32::new(0),
            retries: Mutex::new(Vec::new()),
            holds: Mutex::new(Vec::new()),
            pause_checks: AtomicU32::new(0),
            pause_after: None,
        }
    }

    /// Report a pause request once `checks` pause checks have returned false.
    pub fn pause_after_checks(mut self, checks: u32) -> Self {
        self.pause_after = Some(checks);
        self
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.props
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn finished_count(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> Vec<String> {
        self.retries.lock().unwrap().clone()
    }

    pub fn holds(&self) -> Vec<String> {
        self.holds.lock().unwrap().clone()
    }

    /// Whether the controller has seen no completion report at all.
    pub fn nothing_reported(&self) -> bool {
        self.finished_count() == 0 && self.retries().is_empty() && self.holds().is_empty()
    }
}

#[async_trait]
impl PlanControl for FakeControl {
    fn plan(&self) -> Plan {
        self.plan.clone()
    }

    async fn persist_output_property(&self, key: &str, value: &str) -> Result<()> {
        self.props
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn report_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    async fn report_retry(&self, error: String) {
        self.retries.lock().unwrap().push(error);
    }

    async fn report_hold(&self, error: String) {
        self.holds.lock().unwrap().push(error);
    }

    fn check_pause(&self) -> bool {
        let seen = self.pause_checks.fetch_add(1, Ordering::SeqCst);
        self.pause_after.is_some_and(|after| seen >= after)
    }
}

// ── metadata ────────────────────────────────────────────────────────────

pub struct FakeMetadata {
    application: Option<Application>,
}

impl FakeMetadata {
    pub fn new(application: Application) -> Self {
        Self {
            application: Some(application),
        }
    }

    pub fn failing() -> Self {
        Self { application: None }
    }
}

#[async_trait]
impl MetadataService for FakeMetadata {
    async fn get_application(&self) -> Result<Application> {
        self.application
            .clone()
            .ok_or_else(|| anyhow!("metadata service unavailable"))
    }
}

// ── artifacts ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeArtifacts {
    artifacts: Mutex<Vec<Artifact>>,
    filters: Mutex<Vec<ArtifactFilter>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(artifacts: Vec<Artifact>) -> Self {
        Self {
            artifacts: Mutex::new(artifacts),
            ..Default::default()
        }
    }

    pub fn add(&self, artifact: Artifact) {
        self.artifacts.lock().unwrap().push(artifact);
    }

    pub fn filters(&self) -> Vec<ArtifactFilter> {
        self.filters.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactRepository for FakeArtifacts {
    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        self.filters.lock().unwrap().push(filter.clone());
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.name == filter.name && a.owner == filter.owner)
            .cloned()
            .collect())
    }

    async fn get_artifact(&self, id: &str) -> Result<Artifact> {
        self.lookups.lock().unwrap().push(id.to_string());
        self.artifacts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.uuid == id)
            .cloned()
            .ok_or_else(|| anyhow!("image {} not found", id))
    }
}

// ── instances ───────────────────────────────────────────────────────────

/// Routing-tier fleet whose instances report both plan shards read-only
/// after a restart, unless told to fail their next few checks.
pub struct FakeInstances {
    instances: BTreeMap<String, Instance>,
    shards: (String, String),
    restart_delay: Duration,
    restarts: Mutex<Vec<String>>,
    pending_failures: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_listing: AtomicBool,
}

impl FakeInstances {
    pub fn new(ids: &[&str], plan: &Plan) -> Self {
        let instances = ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    Instance {
                        uuid: id.to_string(),
                        service: "electric-moray".to_string(),
                    },
                )
            })
            .collect();
        Self {
            instances,
            shards: (plan.shard.clone(), plan.new_shard.clone()),
            restart_delay: Duration::from_millis(10),
            restarts: Mutex::new(Vec::new()),
            pending_failures: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_listing: AtomicBool::new(false),
        }
    }

    /// `id` reports a non-converged shard map for its next `times` checks.
    pub fn fail_checks(self, id: &str, times: u32) -> Self {
        self.pending_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), times);
        self
    }

    pub fn fail_listing(self) -> Self {
        self.fail_listing.store(true, Ordering::SeqCst);
        self
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }

    pub fn restart_count(&self, id: &str) -> usize {
        self.restarts().iter().filter(|r| *r == id).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceManager for FakeInstances {
    async fn list_instances(&self, service: &str) -> Result<BTreeMap<String, Instance>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(anyhow!("management API unavailable"));
        }
        Ok(self
            .instances
            .iter()
            .filter(|(_, i)| i.service == service)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn restart_instance(&self, instance_id: &str) -> Result<()> {
        self.restarts.lock().unwrap().push(instance_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.restart_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shard_index_map(&self, instance_id: &str) -> Result<ShardIndexMap> {
        let mut map = ShardIndexMap::new();
        map.insert(self.shards.0.clone(), ShardEntry { read_only: true });

        let mut pending = self.pending_failures.lock().unwrap();
        let fail = match pending.get_mut(instance_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        map.insert(self.shards.1.clone(), ShardEntry { read_only: !fail });
        Ok(map)
    }
}

// ── remote execution ────────────────────────────────────────────────────

static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/progress/([0-9a-f]{32})").unwrap());

/// One remote execution as seen by a [`ScriptedExecutor`].
#[derive(Clone)]
pub struct ScriptCall {
    pub target: String,
    pub script: String,
    /// Progress token found in the rendered script, if any.
    pub token: Option<String>,
    hub: ProgressHub,
}

impl ScriptCall {
    /// POST a progress message as the script would. Panics if rejected.
    pub fn post(&self, message: ProgressMessage) {
        let token = self.token.as_deref().expect("script has no progress URL");
        self.hub.deliver(token, message).unwrap();
    }

    /// Which of the embedded templates produced this script.
    pub fn template(&self) -> &'static str {
        if self.script.contains("STATUS_URL=") {
            "remap-vnodes"
        } else if self.script.contains("manifest.json") {
            "create-archive"
        } else if self.script.contains("rm -rf \"$WORKSPACE\"") {
            "cleanup"
        } else if self.script.contains("workspace ready") {
            "prime-workspace"
        } else {
            "unknown"
        }
    }
}

type Behaviour =
    Box<dyn Fn(ScriptCall) -> BoxFuture<'static, Result<ExecOutput, RemoteError>> + Send + Sync>;

/// Executor whose behaviour is a test closure.
pub struct ScriptedExecutor {
    hub: ProgressHub,
    behaviour: Behaviour,
    calls: Mutex<Vec<ScriptCall>>,
}

impl ScriptedExecutor {
    pub fn new<F, Fut>(hub: ProgressHub, behaviour: F) -> Self
    where
        F: Fn(ScriptCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecOutput, RemoteError>> + Send + 'static,
    {
        Self {
            hub,
            behaviour: Box::new(move |call| Box::pin(behaviour(call))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn templates_run(&self) -> Vec<&'static str> {
        self.calls().iter().map(ScriptCall::template).collect()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute_remote(&self, target: &str, script: &str) -> Result<ExecOutput, RemoteError> {
        let call = ScriptCall {
            target: target.to_string(),
            script: script.to_string(),
            token: TOKEN_REGEX
                .captures(script)
                .map(|c| c[1].to_string()),
            hub: self.hub.clone(),
        };
        self.calls.lock().unwrap().push(call.clone());
        (self.behaviour)(call).await
    }
}

pub fn exec_ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}
