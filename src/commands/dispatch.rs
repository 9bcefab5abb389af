use cdrun::log_status;
use clap::Args;
use serde::Serialize;

use cdrun::dispatch::{self, DispatchResult, Invoker};
use cdrun::payload::RunPayload;
use cdrun::run::{RunPatch, RunStatus};
use cdrun::store::{RunStore, WriteOutcome};

use super::{open_store, read_json_arg, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct DispatchArgs {
    /// Run payload JSON (inline, @file, or - for stdin)
    pub payload: String,

    /// Run ID to use (overrides the payload; generated when neither has one)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Record the run as pending before handing it to the worker host
    #[arg(long)]
    pub pre_create: bool,
}

#[derive(Debug, Serialize)]
pub struct DispatchOutput {
    command: String,
    pre_created: bool,
    #[serde(flatten)]
    result: DispatchResult,
}

pub fn run(args: DispatchArgs, global: &GlobalArgs) -> CmdResult<DispatchOutput> {
    let mut payload = RunPayload::from_value(read_json_arg(&args.payload)?)?;
    if let Some(run_id) = args.run_id {
        payload.run_id = run_id;
    } else if payload.run_id.trim().is_empty() {
        payload.run_id = dispatch::generate_run_id();
    }
    dispatch::validate_run_id(&payload.run_id)?;

    let store = open_store(global)?;
    let config = &global.defaults.dispatch;
    let invoker = Invoker::from_config(config, dispatch::build_transport(config, store.clone())?);

    let (result, pre_created) = dispatch_run(&invoker, store.as_ref(), &payload, args.pre_create)?;

    Ok((
        DispatchOutput {
            command: "dispatch".to_string(),
            pre_created,
            result,
        },
        0,
    ))
}

/// Hand `payload` to the invoker, optionally recording it as pending first.
///
/// Only a record created by this call is touched: an existing run (a
/// duplicate trigger) keeps its state, and a failed dispatch marks only a
/// freshly created record as failed.
fn dispatch_run(
    invoker: &Invoker,
    store: &dyn RunStore,
    payload: &RunPayload,
    pre_create: bool,
) -> cdrun::Result<(DispatchResult, bool)> {
    let pre_created = pre_create
        && store.create_run(&payload.run_id, &payload.created_patch())? == WriteOutcome::Written;

    match invoker.dispatch(payload) {
        Ok(result) => Ok((result, pre_created)),
        Err(err) => {
            if pre_created {
                let failed = RunPatch {
                    status: Some(RunStatus::Failed),
                    completed: Some(true),
                    error: Some(err.summary()),
                    ..RunPatch::default()
                };
                if let Err(write_err) = store.upsert_run(&payload.run_id, &failed) {
                    log_status!("dispatch", "Could not fail pre-created run: {}", write_err.summary());
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrun::dispatch::{
        InProcessTransport, InvocationLedger, InvocationReceipt, InvocationRequest, InvocationTransport,
        MemoryLedger,
    };
    use cdrun::store::SqliteRunStore;
    use cdrun::{Error, ErrorCode};
    use serde_json::json;
    use std::sync::Arc;

    struct RejectingTransport;

    impl InvocationTransport for RejectingTransport {
        fn invoke(&self, request: &InvocationRequest) -> cdrun::Result<InvocationReceipt> {
            Err(Error::dispatch_failed(
                ErrorCode::DispatchRejected,
                &request.headers.idempotency_token,
                Some(500),
                "host unavailable",
            ))
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    fn payload(run_id: &str) -> RunPayload {
        RunPayload::from_value(json!({
            "run_id": run_id,
            "env_name": "envA",
            "clone_url": "https://git.invalid/acme/site.git",
            "auth": { "user_id": "u1", "app_id": "app-1" }
        }))
        .unwrap()
    }

    fn accepting_invoker() -> Invoker {
        let ledger: Arc<dyn InvocationLedger> = Arc::new(MemoryLedger::new());
        let transport = Arc::new(InProcessTransport::new(ledger, Arc::new(|_request: InvocationRequest| {})));
        Invoker::new(transport, "cdrun", "worker")
    }

    #[test]
    fn pre_create_records_pending_run() {
        let store = SqliteRunStore::open_in_memory().unwrap();

        let (result, pre_created) = dispatch_run(&accepting_invoker(), &store, &payload("r1"), true).unwrap();

        assert!(pre_created);
        assert!(!result.deduplicated);
        let run = store.get_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.completed);
    }

    #[test]
    fn duplicate_pre_create_keeps_finished_run() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let invoker = accepting_invoker();

        dispatch_run(&invoker, &store, &payload("r3"), true).unwrap();
        store
            .upsert_run(
                "r3",
                &RunPatch {
                    status: Some(RunStatus::Failed),
                    completed: Some(true),
                    ..RunPatch::default()
                },
            )
            .unwrap();

        let (result, pre_created) = dispatch_run(&invoker, &store, &payload("r3"), true).unwrap();

        assert!(result.deduplicated);
        assert!(!pre_created);
        let run = store.get_run("r3").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed);
    }

    #[test]
    fn failed_dispatch_marks_pre_created_run_failed() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let invoker = Invoker::new(Arc::new(RejectingTransport), "cdrun", "worker");

        let err = dispatch_run(&invoker, &store, &payload("r4"), true).unwrap_err();

        assert_eq!(err.code, ErrorCode::DispatchRejected);
        let run = store.get_run("r4").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed);
        assert!(run.error.unwrap().contains("dispatch.rejected"));
    }

    #[test]
    fn failed_dispatch_leaves_existing_run_alone() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        store
            .upsert_run("r5", &RunPatch::progress(RunStatus::Running, &[]))
            .unwrap();
        let invoker = Invoker::new(Arc::new(RejectingTransport), "cdrun", "worker");

        assert!(dispatch_run(&invoker, &store, &payload("r5"), true).is_err());

        let run = store.get_run("r5").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.completed);
    }

    #[test]
    fn without_pre_create_nothing_is_written() {
        let store = SqliteRunStore::open_in_memory().unwrap();
        let invoker = Invoker::new(Arc::new(RejectingTransport), "cdrun", "worker");

        assert!(dispatch_run(&invoker, &store, &payload("r6"), false).is_err());
        assert!(store.get_run("r6").unwrap().is_none());
    }

    #[test]
    fn output_uses_snake_case_keys() {
        let (result, pre_created) =
            dispatch_run(&accepting_invoker(), &SqliteRunStore::open_in_memory().unwrap(), &payload("r7"), false)
                .unwrap();
        let value = serde_json::to_value(DispatchOutput {
            command: "dispatch".to_string(),
            pre_created,
            result,
        })
        .unwrap();

        assert_eq!(value["run_id"], "r7");
        assert!(value.get("dispatched_at").is_some());
        assert!(value.get("request_id").is_some());
        assert_eq!(value["pre_created"], false);
    }
}
