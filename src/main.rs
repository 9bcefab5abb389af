use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;

use commands::{app, config, dispatch, run, watch, worker};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cdrun")]
#[command(version = VERSION)]
#[command(about = "Dispatch, execute and observe continuous-deployment runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hand a run to the worker host without waiting for it
    Dispatch(dispatch::DispatchArgs),
    /// Execute one run to completion (invoked by the process transport)
    Worker(worker::WorkerArgs),
    /// Poll an environment until its latest run is terminal
    Watch(watch::WatchArgs),
    /// Inspect run records
    Run(run::RunArgs),
    /// Manage Application documents
    #[command(visible_alias = "application")]
    App(app::AppArgs),
    /// Inspect cdrun configuration
    Config(config::ConfigArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let global = GlobalArgs {
        defaults: cdrun::defaults::load_defaults(),
    };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    let _ = output::print_json_result(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
