use cdrun::log_status;
use clap::Args;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use cdrun::observer::{
    self, ApplicationSource, CancellationToken, HttpApplicationSource, ObservedRun, WatchOutcome,
};

use super::{open_store, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct WatchArgs {
    /// Application ID
    pub app_id: String,

    /// Environment name
    pub env_name: String,

    /// Polling interval in milliseconds (defaults to observer.interval_ms)
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct WatchOutput {
    command: String,
    app_id: String,
    env_name: String,
    updates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_run: Option<ObservedRun>,
}

pub fn run(args: WatchArgs, global: &GlobalArgs) -> CmdResult<WatchOutput> {
    let config = &global.defaults.observer;
    let source: Arc<dyn ApplicationSource> = match HttpApplicationSource::from_config(config)? {
        Some(http) => Arc::new(http),
        None => open_store(global)? as Arc<dyn ApplicationSource>,
    };
    let interval = Duration::from_millis(args.interval_ms.unwrap_or(config.interval_ms));

    let mut updates = 0;
    let outcome = observer::watch_blocking(
        source.as_ref(),
        &args.app_id,
        &args.env_name,
        interval,
        &CancellationToken::new(),
        |run| {
            updates += 1;
            log_status!(
                "watch",
                "Run {} is {}",
                run.run_id.as_deref().unwrap_or("?"),
                run.status.as_deref().unwrap_or("unknown")
            );
        },
    );

    match outcome {
        Some(WatchOutcome::Completed(latest_run)) => Ok((
            WatchOutput {
                command: "watch".to_string(),
                app_id: args.app_id,
                env_name: args.env_name,
                updates,
                latest_run,
            },
            0,
        )),
        Some(WatchOutcome::Failed(err)) => Err(err),
        None => Err(cdrun::Error::internal_unexpected("watch cancelled")),
    }
}
