use clap::Args;
use serde::Serialize;

use cdrun::dispatch::LedgerCompletion;
use cdrun::json;
use cdrun::orchestrator::{log_dir_for, Orchestrator};
use cdrun::payload::RunPayload;
use cdrun::run::{RunStatus, StepResult};

use super::{open_store, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct WorkerArgs {
    /// Invocation body (inline, @file, or - for stdin)
    #[arg(long)]
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct WorkerOutput {
    command: String,
    run_id: String,
    status: RunStatus,
    steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    persistence_errors: Vec<String>,
    log_dir: String,
}

pub fn run(args: WorkerArgs, global: &GlobalArgs) -> CmdResult<WorkerOutput> {
    let body = json::read_json_spec_to_string(&args.payload)?;
    let payload = RunPayload::from_body(&body)?;

    let store = open_store(global)?;
    let orchestrator = Orchestrator::from_config(store.clone(), &global.defaults.worker)?;
    let completion = LedgerCompletion::new(store, payload.run_id.clone());

    let outcome = orchestrator.execute(&payload, &completion);
    let exit_code = match outcome.status {
        RunStatus::Succeeded => 0,
        _ => 20,
    };

    Ok((
        WorkerOutput {
            command: "worker".to_string(),
            log_dir: log_dir_for(orchestrator.settings(), &outcome.run_id)
                .display()
                .to_string(),
            run_id: outcome.run_id,
            status: outcome.status,
            steps: outcome.steps,
            error: outcome.error.as_ref().map(cdrun::Error::summary),
            persistence_errors: outcome.persistence_errors.iter().map(cdrun::Error::summary).collect(),
        },
        exit_code,
    ))
}
