//! Run orchestrator: the worker side of a run.
//!
//! One call to [`Orchestrator::execute`] drives one run through
//!
//! ```text
//! Created -> Initializing -> Running(step_i)* -> Completed(Succeeded|Failed)
//! ```
//!
//! and checkpoints the run record at every transition. Errors never escape the
//! lifecycle: any failure after `Created` ends in exactly one terminal
//! checkpoint with `completed = true`, so observers always converge. A failed
//! store write is logged and kept in [`RunOutcome::persistence_errors`]; later
//! checkpoints supersede it, so execution continues.

use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::defaults::{EnvironmentPolicy, WorkerConfig};
use crate::dispatch::memory::InvocationHandler;
use crate::dispatch::{validate_run_id, InvocationLedger, InvocationRequest, LedgerCompletion};
use crate::engine::{
    step_environment, GitCheckout, RuntimeProvisioner, ShellRuntimeProvisioner, ShellStepExecutor,
    SourceCheckout, StepExecutor, StepInvocation,
};
use crate::error::{Error, Result};
use crate::paths;
use crate::payload::RunPayload;
use crate::pipeline;
use crate::run::{RunPatch, RunStatus, StepResult, StepStatus};
use crate::store::{LeaseOutcome, RunStore};
use crate::utils::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Created,
    Initializing,
    Running { step_index: usize },
    Completed { status: RunStatus },
}

impl RunPhase {
    /// Status persisted while the run is in this phase.
    pub fn status(&self) -> RunStatus {
        match self {
            RunPhase::Created => RunStatus::Pending,
            RunPhase::Initializing | RunPhase::Running { .. } => RunStatus::Running,
            RunPhase::Completed { status } => *status,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Created => write!(f, "created"),
            RunPhase::Initializing => write!(f, "initializing"),
            RunPhase::Running { step_index } => write!(f, "running step {}", step_index + 1),
            RunPhase::Completed { status } => write!(f, "completed ({})", status.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub error: Option<Error>,
    pub persistence_errors: Vec<Error>,
}

/// Called once per executed run, after the terminal checkpoint.
pub trait CompletionSignal {
    fn complete(&self, outcome: &RunOutcome);
}

/// Completion signal for callers that have nothing to release.
pub struct NoCompletion;

impl CompletionSignal for NoCompletion {
    fn complete(&self, _outcome: &RunOutcome) {}
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workspace_root: PathBuf,
    pub log_root: PathBuf,
    pub pipeline_file: String,
    pub domain: Option<String>,
    pub unset_envs: Vec<String>,
    pub environment_policy: EnvironmentPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Ok(Self {
            workspace_root: paths::resolve_or(config.workspace_dir.as_deref(), paths::workspaces)?,
            log_root: paths::resolve_or(config.log_dir.as_deref(), paths::logs)?,
            pipeline_file: config.pipeline_file.clone(),
            domain: config.domain.clone(),
            unset_envs: config.unset_envs.clone(),
            environment_policy: config.environment_policy,
        })
    }
}

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    checkout: Arc<dyn SourceCheckout>,
    runtimes: Arc<dyn RuntimeProvisioner>,
    executor: Arc<dyn StepExecutor>,
    settings: WorkerSettings,
}

/// Mutable state of the run being executed.
struct ActiveRun<'a> {
    store: &'a dyn RunStore,
    payload: &'a RunPayload,
    phase: RunPhase,
    steps: Vec<StepResult>,
    persistence_errors: Vec<Error>,
    workspace: PathBuf,
    log_dir: PathBuf,
    lease_held: bool,
    publish_latest: bool,
}

impl<'a> ActiveRun<'a> {
    fn run_log(&self) -> PathBuf {
        self.log_dir.join("run.log")
    }

    fn log(&self, message: &str) {
        let line = format!("{} [{}] {}", Utc::now().to_rfc3339(), self.phase, message);
        // Best effort: the directory is missing when preparing it failed.
        let _ = io::append_line(&self.run_log(), &line, "append run log");
    }

    fn enter(&mut self, phase: RunPhase) {
        self.phase = phase;
        log_status!("worker", "Run {} {}", self.payload.run_id, phase);
        self.log("entered");
    }

    fn record(&mut self, err: Error) {
        log_status!(
            "worker",
            "Checkpoint for run {} not persisted: {}",
            self.payload.run_id,
            err.summary()
        );
        self.log(&format!("checkpoint failed: {}", err.summary()));
        self.persistence_errors.push(err);
    }

    fn checkpoint(&mut self, patch: RunPatch) {
        if let Err(err) = self.store.upsert_run(&self.payload.run_id, &patch) {
            self.record(err);
        }
    }

    fn progress(&mut self) {
        let patch = RunPatch::progress(self.phase.status(), &self.steps);
        self.checkpoint(patch);
    }

    fn publish(&mut self, completed: bool) {
        if !self.publish_latest {
            return;
        }
        let summary = self.payload.summary(self.phase.status(), completed);
        if let Err(err) = self.store.merge_environment_latest_run(
            &self.payload.auth.app_id,
            &self.payload.env_name,
            &summary,
        ) {
            self.record(err);
        }
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        checkout: Arc<dyn SourceCheckout>,
        runtimes: Arc<dyn RuntimeProvisioner>,
        executor: Arc<dyn StepExecutor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            checkout,
            runtimes,
            executor,
            settings,
        }
    }

    /// Worker with git checkout, shell runtime probes and shell steps.
    pub fn from_config(store: Arc<dyn RunStore>, config: &WorkerConfig) -> Result<Self> {
        Ok(Self::new(
            store,
            Arc::new(GitCheckout::new()),
            Arc::new(ShellRuntimeProvisioner::new(config.runtime_setup.clone())),
            Arc::new(ShellStepExecutor::new()),
            WorkerSettings::from_config(config)?,
        ))
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Execute one run to completion and signal `completion` exactly once.
    pub fn execute(&self, payload: &RunPayload, completion: &dyn CompletionSignal) -> RunOutcome {
        if let Err(err) = validate_run_id(&payload.run_id) {
            log_status!("worker", "Refusing run without a usable id: {}", err.summary());
            let outcome = RunOutcome {
                run_id: payload.run_id.clone(),
                status: RunStatus::Failed,
                steps: Vec::new(),
                error: Some(err),
                persistence_errors: Vec::new(),
            };
            completion.complete(&outcome);
            return outcome;
        }

        let mut run = ActiveRun {
            store: self.store.as_ref(),
            payload,
            phase: RunPhase::Created,
            steps: Vec::new(),
            persistence_errors: Vec::new(),
            workspace: workspace_for(&self.settings, &payload.run_id),
            log_dir: log_dir_for(&self.settings, &payload.run_id),
            lease_held: false,
            publish_latest: true,
        };

        let (status, error) = match self.drive(&mut run) {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(err) => {
                run.log(&format!("fatal: {}", err.summary()));
                (RunStatus::Failed, Some(err))
            }
        };

        let outcome = self.finish(run, status, error);
        completion.complete(&outcome);
        outcome
    }

    fn drive(&self, run: &mut ActiveRun<'_>) -> Result<()> {
        let payload = run.payload;

        if let Err(err) = io::empty_dir(&run.log_dir, "prepare run log dir") {
            log_status!("worker", "Run log unavailable: {}", err.summary());
        }
        run.enter(RunPhase::Created);
        run.checkpoint(payload.created_patch());

        if self.settings.environment_policy == EnvironmentPolicy::Exclusive {
            match self.store.acquire_environment_lease(
                &payload.auth.app_id,
                &payload.env_name,
                &payload.run_id,
            )? {
                LeaseOutcome::Acquired => run.lease_held = true,
                LeaseOutcome::Busy { holder_run_id } => {
                    run.publish_latest = false;
                    return Err(Error::environment_busy(
                        &payload.auth.app_id,
                        &payload.env_name,
                        &holder_run_id,
                    ));
                }
            }
        }
        run.publish(false);

        run.enter(RunPhase::Initializing);
        self.checkout.checkout(payload, &run.workspace)?;
        run.log("checkout finished");

        let spec = pipeline::parse_spec(&run.workspace.join(&self.settings.pipeline_file))?;
        run.log(&format!("pipeline has {} step(s)", spec.steps.len()));
        run.progress();
        run.publish(false);

        self.runtimes.provision(&spec.runtimes, &run.workspace)?;

        let env = step_environment(payload, self.settings.domain.as_deref());
        for (step_index, step) in spec.steps.iter().enumerate() {
            run.enter(RunPhase::Running { step_index });
            run.steps.push(StepResult {
                name: step.display_name().to_string(),
                status: StepStatus::Running,
                started_at: Utc::now().to_rfc3339(),
                finished_at: None,
                summary: None,
            });
            run.progress();

            let execution = self.executor.execute(
                step,
                &StepInvocation {
                    run_id: &payload.run_id,
                    workspace: &run.workspace,
                    log_dir: &run.log_dir,
                    env: &env,
                    unset_envs: &self.settings.unset_envs,
                },
            );

            if let Some(current) = run.steps.last_mut() {
                *current = execution.result;
            }
            run.progress();

            if let Some(err) = execution.error {
                return Err(err);
            }
        }

        Ok(())
    }

    fn finish(&self, mut run: ActiveRun<'_>, status: RunStatus, error: Option<Error>) -> RunOutcome {
        run.enter(RunPhase::Completed { status });
        run.checkpoint(RunPatch {
            status: Some(status),
            steps: Some(run.steps.clone()),
            completed: Some(status.is_terminal()),
            error: error.as_ref().map(Error::summary),
            ..RunPatch::default()
        });
        run.publish(status.is_terminal());

        if run.lease_held {
            let payload = run.payload;
            if let Err(err) = self.store.release_environment_lease(
                &payload.auth.app_id,
                &payload.env_name,
                &payload.run_id,
            ) {
                run.record(err);
            }
        }

        RunOutcome {
            run_id: run.payload.run_id.clone(),
            status,
            steps: run.steps,
            error,
            persistence_errors: run.persistence_errors,
        }
    }
}

/// Handler that executes invocation bodies with `orchestrator` and closes
/// their ledger entry when the run completes.
pub fn invocation_handler(
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<dyn InvocationLedger>,
) -> InvocationHandler {
    Arc::new(move |request: InvocationRequest| {
        let token = request.headers.idempotency_token.clone();
        match RunPayload::from_body(&request.body) {
            Ok(payload) => {
                let completion = LedgerCompletion::new(Arc::clone(&ledger), token);
                orchestrator.execute(&payload, &completion);
            }
            Err(err) => {
                log_status!("worker", "Invocation {} has an unreadable body: {}", token, err.summary());
                let _ = ledger.complete(&token, "rejected");
            }
        }
    })
}

/// Workspace path of a run, as laid out by [`Orchestrator`].
pub fn workspace_for(settings: &WorkerSettings, run_id: &str) -> PathBuf {
    settings.workspace_root.join(run_id)
}

/// Log directory of a run, as laid out by [`Orchestrator`].
pub fn log_dir_for(settings: &WorkerSettings, run_id: &str) -> PathBuf {
    settings.log_root.join(run_id)
}
