use clap::{Args, Subcommand};
use serde::Serialize;

use cdrun::run::Run;
use cdrun::store::RunStore;

use super::{open_store, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct RunArgs {
    #[command(subcommand)]
    command: RunCommand,
}

#[derive(Subcommand)]
enum RunCommand {
    /// Show the stored record of a run
    Show {
        /// Run ID
        run_id: String,
    },
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    command: String,
    run: Run,
}

pub fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<RunOutput> {
    match args.command {
        RunCommand::Show { run_id } => {
            let store = open_store(global)?;
            let run = store
                .get_run(&run_id)?
                .ok_or_else(|| cdrun::Error::run_not_found(&run_id))?;
            Ok((
                RunOutput {
                    command: "run.show".to_string(),
                    run,
                },
                0,
            ))
        }
    }
}
