use std::sync::Arc;

use cdrun::defaults::Defaults;
use cdrun::json;
use cdrun::store::SqliteRunStore;

pub type CmdResult<T> = cdrun::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub defaults: Defaults,
}

pub mod app;
pub mod config;
pub mod dispatch;
pub mod run;
pub mod watch;
pub mod worker;

/// Open the configured run record store.
pub(crate) fn open_store(global: &GlobalArgs) -> cdrun::Result<Arc<SqliteRunStore>> {
    Ok(Arc::new(SqliteRunStore::open_configured(&global.defaults.store)?))
}

/// Read a JSON document given inline, as `@file`, or `-` for stdin.
pub(crate) fn read_json_arg(spec: &str) -> cdrun::Result<serde_json::Value> {
    let raw = json::read_json_spec_to_string(spec)?;
    json::from_str(&raw)
}

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (cdrun::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Dispatch(args) => dispatch!(args, global, dispatch),
        crate::Commands::Worker(args) => dispatch!(args, global, worker),
        crate::Commands::Watch(args) => dispatch!(args, global, watch),
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::App(args) => dispatch!(args, global, app),
        crate::Commands::Config(args) => dispatch!(args, global, config),
    }
}
