use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::Value;

use cdrun::run::Application;
use cdrun::store::RunStore;

use super::{open_store, read_json_arg, CmdResult, GlobalArgs};

#[derive(Args)]
pub struct AppArgs {
    #[command(subcommand)]
    command: AppCommand,
}

#[derive(Subcommand)]
enum AppCommand {
    /// Show an Application document
    Show {
        /// Application ID
        app_id: String,
    },
    /// Store a full Application document (must contain app_id)
    Put {
        /// JSON document (inline, @file, or - for stdin)
        spec: String,
    },
    /// Deep-merge a partial document into an Application
    Update {
        /// Application ID
        app_id: String,
        /// JSON patch (inline, @file, or - for stdin); null removes a key
        spec: String,
    },
}

#[derive(Debug, Serialize)]
pub struct AppOutput {
    command: String,
    app_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    application: Value,
}

/// Check that `doc` has the Application shape before it is stored.
fn parse_application(doc: &Value) -> cdrun::Result<Application> {
    let app: Application = serde_json::from_value(doc.clone())
        .map_err(|e| cdrun::Error::validation_invalid_json(e, Some("decode application".to_string())))?;
    if app.app_id.trim().is_empty() {
        return Err(cdrun::Error::validation_invalid_argument(
            "app_id",
            "Application document needs an app_id",
            None,
            None,
        ));
    }
    Ok(app)
}

pub fn run(args: AppArgs, global: &GlobalArgs) -> CmdResult<AppOutput> {
    let store = open_store(global)?;

    let (command, app_id, version) = match args.command {
        AppCommand::Show { app_id } => ("app.show", app_id, None),
        AppCommand::Put { spec } => {
            let doc = read_json_arg(&spec)?;
            let app = parse_application(&doc)?;
            let version = store.put_application(&doc)?;
            ("app.put", app.app_id, Some(version))
        }
        AppCommand::Update { app_id, spec } => {
            let patch = read_json_arg(&spec)?;
            let version = store.update_application(&app_id, patch)?;
            ("app.update", app_id, Some(version))
        }
    };

    let application = store
        .get_application(&app_id)?
        .ok_or_else(|| cdrun::Error::application_not_found(&app_id))?;

    Ok((
        AppOutput {
            command: command.to_string(),
            app_id,
            version,
            application,
        },
        0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrun::ErrorCode;
    use serde_json::json;

    #[test]
    fn application_shape_is_accepted() {
        let app = parse_application(&json!({
            "app_id": "app-1",
            "provider": "github",
            "environment": {
                "prod": {
                    "trigger_spec": { "push": ["main"] },
                    "secrets": { "TOKEN": "t" },
                    "latest_task": { "run_id": "r1", "completed": true, "status": "succeeded" }
                }
            }
        }))
        .unwrap();

        assert_eq!(app.app_id, "app-1");
        assert_eq!(app.environment["prod"].secrets["TOKEN"], "t");
        assert_eq!(app.environment["prod"].latest_task.as_ref().unwrap().run_id, "r1");
    }

    #[test]
    fn malformed_environment_is_rejected() {
        let err = parse_application(&json!({
            "app_id": "app-1",
            "environment": { "prod": { "secrets": ["not", "a", "map"] } }
        }))
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationInvalidJson);
    }

    #[test]
    fn missing_app_id_is_rejected() {
        assert!(parse_application(&json!({ "provider": "github" })).is_err());
        let err = parse_application(&json!({ "app_id": " " })).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationInvalidArgument);
    }
}
