use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationMissingArgument,
    ValidationInvalidArgument,
    ValidationInvalidJson,

    ApplicationNotFound,
    EnvironmentNotFound,
    RunNotFound,
    EnvironmentBusy,

    DispatchRejected,
    DispatchAuthFailed,
    DispatchQuotaExceeded,

    RunCheckoutFailed,
    RunPipelineInvalid,
    RunRuntimeSetupFailed,
    RunStepFailed,

    StoreReadFailed,
    StoreWriteFailed,

    WatchFetchFailed,
    WatchMalformedState,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidJson => "validation.invalid_json",

            ErrorCode::ApplicationNotFound => "application.not_found",
            ErrorCode::EnvironmentNotFound => "environment.not_found",
            ErrorCode::RunNotFound => "run.not_found",
            ErrorCode::EnvironmentBusy => "environment.busy",

            ErrorCode::DispatchRejected => "dispatch.rejected",
            ErrorCode::DispatchAuthFailed => "dispatch.auth_failed",
            ErrorCode::DispatchQuotaExceeded => "dispatch.quota_exceeded",

            ErrorCode::RunCheckoutFailed => "run.checkout_failed",
            ErrorCode::RunPipelineInvalid => "run.pipeline_invalid",
            ErrorCode::RunRuntimeSetupFailed => "run.runtime_setup_failed",
            ErrorCode::RunStepFailed => "run.step_failed",

            ErrorCode::StoreReadFailed => "store.read_failed",
            ErrorCode::StoreWriteFailed => "store.write_failed",

            ErrorCode::WatchFetchFailed => "watch.fetch_failed",
            ErrorCode::WatchMalformedState => "watch.malformed_state",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailedDetails {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailedDetails {
    pub run_id: String,
    pub step: String,
    pub exit_code: i32,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreErrorDetails {
    pub operation: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentBusyDetails {
    pub app_id: String,
    pub env_name: String,
    pub holder_run_id: String,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.into(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            "Invalid argument",
            details,
        )
    }

    pub fn validation_invalid_json(err: serde_json::Error, context: Option<String>) -> Self {
        let details = serde_json::json!({
            "error": err.to_string(),
            "context": context,
        });

        Self::new(ErrorCode::ValidationInvalidJson, "Invalid JSON", details)
    }

    pub fn application_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::ApplicationNotFound, "Application not found", id)
            .with_hint("Run 'cdrun app put <spec>' to register the application")
    }

    pub fn environment_not_found(app_id: &str, env_name: &str) -> Self {
        Self::not_found(
            ErrorCode::EnvironmentNotFound,
            "Environment not found",
            format!("{}/{}", app_id, env_name),
        )
    }

    pub fn run_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::RunNotFound, "Run not found", id)
    }

    fn not_found(code: ErrorCode, message: &str, id: impl Into<String>) -> Self {
        Self::new(code, message, to_details(NotFoundDetails { id: id.into() }))
    }

    pub fn environment_busy(app_id: &str, env_name: &str, holder_run_id: &str) -> Self {
        let details = to_details(EnvironmentBusyDetails {
            app_id: app_id.to_string(),
            env_name: env_name.to_string(),
            holder_run_id: holder_run_id.to_string(),
        });

        Self::new(
            ErrorCode::EnvironmentBusy,
            format!(
                "Environment '{}' is held by run '{}'",
                env_name, holder_run_id
            ),
            details,
        )
        .with_retryable(true)
    }

    pub fn dispatch_failed(
        code: ErrorCode,
        run_id: impl Into<String>,
        status: Option<u16>,
        error: impl Into<String>,
    ) -> Self {
        let message = match code {
            ErrorCode::DispatchAuthFailed => "Invocation transport rejected credentials",
            ErrorCode::DispatchQuotaExceeded => "Invocation transport quota exceeded",
            _ => "Invocation transport rejected the run",
        };
        let retryable = code == ErrorCode::DispatchQuotaExceeded;
        let details = to_details(DispatchFailedDetails {
            run_id: run_id.into(),
            status,
            error: error.into(),
        });

        Self::new(code, message, details).with_retryable(retryable)
    }

    pub fn checkout_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::RunCheckoutFailed,
            message,
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn pipeline_invalid(path: impl Into<String>, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        Self::new(
            ErrorCode::RunPipelineInvalid,
            format!("Invalid pipeline specification: {}", problem),
            serde_json::json!({ "path": path.into(), "problem": problem }),
        )
    }

    pub fn runtime_setup_failed(runtime: impl Into<String>, error: impl Into<String>) -> Self {
        let runtime = runtime.into();
        Self::new(
            ErrorCode::RunRuntimeSetupFailed,
            format!("Runtime '{}' setup failed", runtime),
            serde_json::json!({ "runtime": runtime, "error": error.into() }),
        )
    }

    pub fn step_failed(details: StepFailedDetails) -> Self {
        let message = format!(
            "Step '{}' exited with code {}",
            details.step, details.exit_code
        );
        Self::new(ErrorCode::RunStepFailed, message, to_details(details))
    }

    pub fn store_read(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let details = to_details(StoreErrorDetails {
            operation: operation.into(),
            error: error.to_string(),
        });
        Self::new(ErrorCode::StoreReadFailed, "Run record store read failed", details)
    }

    pub fn store_write(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let details = to_details(StoreErrorDetails {
            operation: operation.into(),
            error: error.to_string(),
        });
        Self::new(
            ErrorCode::StoreWriteFailed,
            "Run record store write failed",
            details,
        )
        .with_retryable(true)
    }

    pub fn watch_fetch_failed(app_id: &str, error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::WatchFetchFailed,
            "Failed to fetch application state",
            serde_json::json!({ "appId": app_id, "error": error.into() }),
        )
        .with_hint("Check the application still exists, then watch again")
    }

    pub fn watch_malformed_state(app_id: &str, problem: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::WatchMalformedState,
            "Application state is missing or invalid",
            serde_json::json!({ "appId": app_id, "problem": problem.into() }),
        )
        .with_hint("The application or environment may have been deleted")
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            "Invalid configuration value",
            details,
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::internal_unexpected(message)
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// One-line description used in run records and logs.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.code.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_failures_are_retryable() {
        let err = Error::dispatch_failed(ErrorCode::DispatchQuotaExceeded, "r1", Some(429), "slow down");
        assert_eq!(err.retryable, Some(true));
        assert_eq!(err.details["runId"], "r1");
        assert_eq!(err.details["status"], 429);
    }

    #[test]
    fn auth_failures_are_not_retryable() {
        let err = Error::dispatch_failed(ErrorCode::DispatchAuthFailed, "r1", Some(403), "denied");
        assert_eq!(err.retryable, Some(false));
        assert_eq!(err.code.as_str(), "dispatch.auth_failed");
    }

    #[test]
    fn summary_includes_code_and_message() {
        let err = Error::checkout_failed("git fetch failed");
        assert_eq!(err.summary(), "run.checkout_failed: git fetch failed");
    }

    #[test]
    fn step_failed_message_names_step() {
        let err = Error::step_failed(StepFailedDetails {
            run_id: "r2".to_string(),
            step: "build".to_string(),
            exit_code: 2,
            stderr: "boom".to_string(),
        });
        assert_eq!(err.message, "Step 'build' exited with code 2");
        assert_eq!(err.details["stderr"], "boom");
    }
}
