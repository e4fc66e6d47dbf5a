//! Remap vnodes into a new hash ring image.
//!
//! Steps, in order:
//!
//! 1. load the four script templates
//! 2. refresh the application record and build the script variables
//! 3. look for an image already produced for this plan; adopt it and skip
//!    to verification if there is exactly one
//! 4. pick the first routing-tier instance as the execution target
//! 5. prime a workspace on the target (the phase is hold-eligible from here)
//! 6. remap vnodes, watched through a progress endpoint and stall timer
//! 7. pack and upload the new image
//! 8. remove the workspace, if this attempt created the image
//! 9. confirm the image exists in the repository
//!
//! Re-running the phase after a partial failure is safe: every work step is
//! skipped once the image is known.

use super::PhaseEnv;
use crate::collaborators::{Collaborators, ExecOutput};
use crate::config::ReshardConfig;
use crate::errors::{PhaseError, PhaseFailure};
use crate::escalation::{Escalation, PhaseOutcome};
use crate::plan::{ArtifactFilter, Plan, Workspace, is_uuid};
use crate::progress::ProgressHub;
use crate::remote::{GuardedRemoteStep, Resolution};
use crate::sequencer::{Flow, SequenceResult, StepKind, StepRunner, run_sequence};
use crate::template::{ScriptVars, TemplateLoader, TemplateSet};
use anyhow::anyhow;
use async_trait::async_trait;

pub const TEMPLATES: [&str; 4] = ["prime-workspace", "remap-vnodes", "create-archive", "cleanup"];

pub const PROP_NEW_RING: &str = "new_hash_ring_uuid";
pub const PROP_OLD_RING: &str = "old_hash_ring_uuid";

const META_IMGAPI_SERVICE: &str = "HASH_RING_IMGAPI_SERVICE";
const META_IMAGE: &str = "HASH_RING_IMAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    LoadTemplates,
    RefreshApplication,
    CheckExistingArtifact,
    SelectTarget,
    PrimeWorkspace,
    RemapVnodes,
    CreateArchive,
    Cleanup,
    VerifyArtifact,
}

const STEPS: [Step; 9] = [
    Step::LoadTemplates,
    Step::RefreshApplication,
    Step::CheckExistingArtifact,
    Step::SelectTarget,
    Step::PrimeWorkspace,
    Step::RemapVnodes,
    Step::CreateArchive,
    Step::Cleanup,
    Step::VerifyArtifact,
];

/// Mutable state threaded through the steps of one attempt.
pub struct RemapContext {
    pub plan: Plan,
    pub workspace: Workspace,
    pub vars: ScriptVars,
    templates: Option<TemplateSet>,
    pub target: Option<String>,
    /// Image produced for this plan, by this attempt or an earlier one.
    pub artifact: Option<String>,
    /// Image the new ring was derived from.
    pub old_artifact: Option<String>,
    /// Whether this attempt created the image and must remove its workspace.
    pub perform_cleanup: bool,
    /// Set once the workspace is primed; cleared when it has been removed.
    workspace_open: bool,
    pub escalation: Escalation,
}

impl RemapContext {
    pub fn new(plan: Plan) -> Self {
        let workspace = Workspace::allocate(&plan);
        let mut vars = ScriptVars::new();
        vars.set("WORKSPACE_ID", workspace.id.as_str())
            .set("TRANSITION", plan.transition())
            .set("PLAN_UUID", plan.uuid.as_str())
            .set("SHARD", plan.shard.as_str())
            .set("NEW_SHARD", plan.new_shard.as_str());

        Self {
            plan,
            workspace,
            vars,
            templates: None,
            target: None,
            artifact: None,
            old_artifact: None,
            perform_cleanup: false,
            workspace_open: false,
            escalation: Escalation::new(),
        }
    }

    fn render(&self, name: &str) -> Result<String, PhaseError> {
        let templates = self
            .templates
            .as_ref()
            .ok_or_else(|| PhaseError::OutOfOrder("templates not loaded".to_string()))?;
        Ok(templates.render(name, &self.vars)?)
    }

    fn target(&self) -> Result<&str, PhaseError> {
        self.target
            .as_deref()
            .ok_or_else(|| PhaseError::OutOfOrder("no execution target selected".to_string()))
    }
}

pub struct RemapRing {
    collab: Collaborators,
    config: ReshardConfig,
    hub: ProgressHub,
    loader: TemplateLoader,
}

impl RemapRing {
    pub fn new(env: &PhaseEnv) -> Self {
        Self {
            collab: env.collaborators.clone(),
            config: env.config.clone(),
            hub: env.hub.clone(),
            loader: TemplateLoader::new(env.config.templates.dir.clone()),
        }
    }

    /// Run the phase and report its outcome to the plan controller.
    pub async fn run(&self) -> PhaseOutcome {
        let control = self.collab.control.as_ref();
        let mut ctx = RemapContext::new(control.plan());

        let result = match run_sequence(self, &STEPS, &mut ctx, control).await {
            Ok(SequenceResult::Paused { at }) => {
                tracing::info!(step = at, "remap paused");
                return PhaseOutcome::Paused;
            }
            Ok(SequenceResult::Completed) => self.finish(&ctx).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => PhaseOutcome::Finished,
            Err(source) => {
                let failure = PhaseFailure {
                    context: "remapping vnodes".to_string(),
                    workspace_id: Some(ctx.workspace.id.clone()),
                    target: ctx.target.clone(),
                    source,
                };
                ctx.escalation.escalate(control, failure).await
            }
        }
    }

    async fn finish(&self, ctx: &RemapContext) -> Result<(), PhaseError> {
        let control = self.collab.control.as_ref();
        let new_ring = ctx
            .artifact
            .as_deref()
            .ok_or_else(|| PhaseError::InvalidArtifactId(String::new()))?;
        let old_ring = ctx.old_artifact.as_deref().unwrap_or_default();

        control
            .persist_output_property(PROP_NEW_RING, new_ring)
            .await
            .map_err(|e| PhaseError::collaborator("storing new hash ring uuid", e))?;
        control
            .persist_output_property(PROP_OLD_RING, old_ring)
            .await
            .map_err(|e| PhaseError::collaborator("storing old hash ring uuid", e))?;

        tracing::info!(new_ring, old_ring, "hash ring remapped");
        control.report_finished().await;
        Ok(())
    }

    /// Run a non-guarded script on the target; a non-zero exit is a failure.
    async fn exec(&self, ctx: &RemapContext, label: &str, template: &str) -> Result<ExecOutput, PhaseError> {
        let target = ctx.target()?;
        let script = ctx.render(template)?;
        let output = self
            .collab
            .executor
            .execute_remote(target, &script)
            .await
            .map_err(|source| PhaseError::RemoteTransport {
                step: label.to_string(),
                source,
            })?;

        tracing::info!(
            step = label,
            exit_status = output.exit_status,
            stdout = %output.stdout.trim(),
            stderr = %output.stderr.trim(),
            "output"
        );

        if !output.success() {
            return Err(PhaseError::RemoteExecution {
                step: label.to_string(),
                message: format!("exited with status {}", output.exit_status),
            });
        }
        Ok(output)
    }

    async fn load_templates(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        self.collab.status.update("loading script templates");
        ctx.templates = Some(self.loader.load_set(&TEMPLATES)?);
        Ok(Flow::Continue)
    }

    async fn refresh_application(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        const OP: &str = "refreshing application";
        self.collab.status.update("refreshing application metadata");

        let app = self
            .collab
            .metadata
            .get_application()
            .await
            .map_err(|e| PhaseError::collaborator(OP, e))?;

        let metadata = |key: &str| {
            app.metadata_value(key)
                .map(str::to_string)
                .ok_or_else(|| PhaseError::collaborator(OP, anyhow!("metadata has no {}", key)))
        };
        let imgapi = metadata(META_IMGAPI_SERVICE)?;
        let image = metadata(META_IMAGE)?;

        if !is_uuid(&app.owner_uuid) {
            return Err(PhaseError::collaborator(
                OP,
                anyhow!("owner_uuid \"{}\" is not a uuid", app.owner_uuid),
            ));
        }

        ctx.vars
            .set(META_IMGAPI_SERVICE, imgapi)
            .set(META_IMAGE, image.as_str())
            .set("POSEIDON_UUID", app.owner_uuid.as_str());
        ctx.old_artifact = Some(image);

        tracing::info!(script_opts = ?ctx.vars, "script options");
        Ok(Flow::Continue)
    }

    async fn check_existing_artifact(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        self.collab
            .status
            .update("checking for existing updated hash ring image");

        let filter = ArtifactFilter {
            name: self.config.artifacts.name.clone(),
            owner: ctx.vars.get("POSEIDON_UUID").unwrap_or_default().to_string(),
        };
        let found = self
            .collab
            .artifacts
            .list_artifacts(&filter)
            .await
            .map_err(|e| PhaseError::collaborator("listing hash ring images", e))?;

        let ours: Vec<String> = found
            .into_iter()
            .filter(|a| a.has_tag(&self.config.artifacts.plan_tag, &ctx.plan.uuid))
            .map(|a| a.uuid)
            .collect();

        match ours.as_slice() {
            [] => {
                tracing::info!("existing image not found");
                Ok(Flow::Continue)
            }
            [existing] => {
                if !is_uuid(existing) {
                    return Err(PhaseError::InvalidArtifactId(existing.clone()));
                }
                tracing::info!(image = %existing, "existing image found");
                ctx.artifact = Some(existing.clone());
                Ok(Flow::SkipToVerify)
            }
            _ => {
                tracing::warn!(images = ?ours, "found more than one image for this plan");
                ctx.escalation
                    .mark_side_effect("multiple images exist for this plan");
                Err(PhaseError::AmbiguousState {
                    plan: ctx.plan.uuid.clone(),
                    artifacts: ours,
                })
            }
        }
    }

    async fn select_target(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        if ctx.artifact.is_some() {
            return Ok(Flow::Continue);
        }

        let service = &self.config.restart.service;
        tracing::info!(service = %service, "listing instances");
        let instances = self
            .collab
            .instances
            .list_instances(service)
            .await
            .map_err(|e| PhaseError::collaborator(format!("listing \"{}\" instances", service), e))?;

        let (_, first) = instances.into_iter().next().ok_or_else(|| {
            PhaseError::collaborator(
                "selecting target",
                anyhow!("did not find any \"{}\" instances", service),
            )
        })?;
        ctx.target = Some(first.uuid);
        Ok(Flow::Continue)
    }

    async fn prime_workspace(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        if ctx.artifact.is_some() {
            return Ok(Flow::Continue);
        }

        // Files and processes may be left on the target from here on.
        ctx.escalation.mark_side_effect("workspace created on target");
        ctx.workspace_open = true;

        let target = ctx.target()?.to_string();
        let status = &self.collab.status;
        status.clear();
        status.update("remapping vnodes");
        status.prop("via zone", &target);
        status.trunc();
        status.child().update("unpacking copy of hash ring");
        tracing::info!(target_zone = %target, workspace = %ctx.workspace.id, "priming workspace");

        self.exec(ctx, "prime workspace", "prime-workspace").await?;
        Ok(Flow::Continue)
    }

    async fn remap_vnodes(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        if ctx.artifact.is_some() {
            return Ok(Flow::Continue);
        }

        let target = ctx.target()?.to_string();
        self.collab.status.trunc();

        let endpoint = self.hub.register();
        ctx.vars.set("STATUS_URL", endpoint.url());
        let script = ctx.render("remap-vnodes")?;

        tracing::info!(target_zone = %target, status_url = endpoint.url(), "remapping vnodes");
        let report = GuardedRemoteStep::new(
            self.collab.executor.as_ref(),
            self.collab.status.clone(),
            &self.config.watchdog,
        )
        .run("remap vnodes", &target, &script, endpoint)
        .await?;

        match &report.resolution {
            Resolution::ProgressFinished { total, .. } => {
                tracing::info!(messages = report.messages, units = ?total, "script finished");
            }
            Resolution::ExitStatus => {
                tracing::info!(messages = report.messages, "script exited 0");
            }
        }
        Ok(Flow::Continue)
    }

    async fn create_archive(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        if ctx.artifact.is_some() {
            return Ok(Flow::Continue);
        }

        self.collab.status.trunc();
        self.collab
            .status
            .child()
            .update("uploading remapped hash ring");
        tracing::info!("uploading modified archive");

        let output = self.exec(ctx, "create archive", "create-archive").await?;
        let id = output.stdout.trim();
        if !is_uuid(id) {
            return Err(PhaseError::InvalidArtifactId(id.to_string()));
        }

        ctx.artifact = Some(id.to_string());
        ctx.perform_cleanup = true;
        Ok(Flow::Continue)
    }

    async fn cleanup(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        if !ctx.perform_cleanup {
            return Ok(Flow::Continue);
        }

        self.collab.status.trunc();
        self.collab.status.child().update("removing working directory");
        tracing::info!(workspace = %ctx.workspace.id, "removing workspace");

        self.exec(ctx, "cleanup", "cleanup").await?;
        ctx.workspace_open = false;
        Ok(Flow::Continue)
    }

    async fn verify_artifact(&self, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        let id = ctx
            .artifact
            .clone()
            .ok_or_else(|| PhaseError::InvalidArtifactId(String::new()))?;

        let status = &self.collab.status;
        status.clear();
        status.trunc();
        status.child().update("checking for correct hash ring upload");

        let image = self
            .collab
            .artifacts
            .get_artifact(&id)
            .await
            .map_err(|e| PhaseError::collaborator(format!("checking image ({})", id), e))?;
        tracing::info!(image = %image.uuid, name = %image.name, "checked hash ring image");
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl StepRunner for RemapRing {
    type Step = Step;
    type Context = RemapContext;

    fn name(step: Step) -> &'static str {
        match step {
            Step::LoadTemplates => "load templates",
            Step::RefreshApplication => "refresh application",
            Step::CheckExistingArtifact => "check existing image",
            Step::SelectTarget => "select target",
            Step::PrimeWorkspace => "prime workspace",
            Step::RemapVnodes => "remap vnodes",
            Step::CreateArchive => "create archive",
            Step::Cleanup => "cleanup",
            Step::VerifyArtifact => "verify image",
        }
    }

    fn kind(step: Step) -> StepKind {
        match step {
            Step::LoadTemplates | Step::RefreshApplication | Step::CheckExistingArtifact => {
                StepKind::Setup
            }
            Step::SelectTarget
            | Step::PrimeWorkspace
            | Step::RemapVnodes
            | Step::CreateArchive
            | Step::Cleanup => StepKind::Work,
            Step::VerifyArtifact => StepKind::Verify,
        }
    }

    /// A primed workspace is either removed or held, never left behind by a pause.
    fn pausable(&self, _step: Step, ctx: &RemapContext) -> bool {
        !ctx.workspace_open
    }

    async fn run_step(&self, step: Step, ctx: &mut RemapContext) -> Result<Flow, PhaseError> {
        match step {
            Step::LoadTemplates => self.load_templates(ctx).await,
            Step::RefreshApplication => self.refresh_application(ctx).await,
            Step::CheckExistingArtifact => self.check_existing_artifact(ctx).await,
            Step::SelectTarget => self.select_target(ctx).await,
            Step::PrimeWorkspace => self.prime_workspace(ctx).await,
            Step::RemapVnodes => self.remap_vnodes(ctx).await,
            Step::CreateArchive => self.create_archive(ctx).await,
            Step::Cleanup => self.cleanup(ctx).await,
            Step::VerifyArtifact => self.verify_artifact(ctx).await,
        }
    }
}
