//! CLI response formatting and output.
//!
//! Provides JSON envelope, printing, and exit code mapping.

use cdrun::error::Hint;
use cdrun::{Error, ErrorCode, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<Hint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl<T: Serialize> CliResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            Error::internal_json(e.to_string(), Some("serialize response".to_string()))
        })
    }
}

impl CliResponse<()> {
    pub fn from_error(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CliError {
                code: err.code.as_str().to_string(),
                message: err.message.clone(),
                details: err.details.clone(),
                hints: if err.hints.is_empty() {
                    None
                } else {
                    Some(err.hints.clone())
                },
                retryable: err.retryable,
            }),
        }
    }
}

fn print_response<T: Serialize>(response: &CliResponse<T>) -> Result<()> {
    use std::io::{self, Write};

    let payload = response.to_json()?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", payload) {
        if e.kind() == io::ErrorKind::BrokenPipe {
            return Ok(()); // Exit gracefully on SIGPIPE
        }
        return Err(Error::internal_io(
            e.to_string(),
            Some("write stdout".to_string()),
        ));
    }
    Ok(())
}

pub fn print_success<T: Serialize>(data: T) -> Result<()> {
    print_response(&CliResponse::success(data))
}

pub fn map_cmd_result_to_json<T: Serialize>(
    result: Result<(T, i32)>,
) -> (Result<serde_json::Value>, i32) {
    match result {
        Ok((data, exit_code)) => match serde_json::to_value(data) {
            Ok(value) => (Ok(value), exit_code),
            Err(err) => (
                Err(Error::internal_json(
                    err.to_string(),
                    Some("serialize response".to_string()),
                )),
                1,
            ),
        },
        Err(err) => {
            let exit_code = exit_code_for_error(err.code);
            (Err(err), exit_code)
        }
    }
}

/// Exit codes: 2 usage/config, 4 not found, 20 dispatch or run, 30 store or
/// watch, 1 internal.
pub(crate) fn exit_code_for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::ConfigInvalidJson
        | ErrorCode::ConfigInvalidValue
        | ErrorCode::ValidationMissingArgument
        | ErrorCode::ValidationInvalidArgument
        | ErrorCode::ValidationInvalidJson => 2,

        ErrorCode::ApplicationNotFound
        | ErrorCode::EnvironmentNotFound
        | ErrorCode::RunNotFound => 4,

        ErrorCode::EnvironmentBusy
        | ErrorCode::DispatchRejected
        | ErrorCode::DispatchAuthFailed
        | ErrorCode::DispatchQuotaExceeded
        | ErrorCode::RunCheckoutFailed
        | ErrorCode::RunPipelineInvalid
        | ErrorCode::RunRuntimeSetupFailed
        | ErrorCode::RunStepFailed => 20,

        ErrorCode::StoreReadFailed
        | ErrorCode::StoreWriteFailed
        | ErrorCode::WatchFetchFailed
        | ErrorCode::WatchMalformedState => 30,

        ErrorCode::InternalIoError
        | ErrorCode::InternalJsonError
        | ErrorCode::InternalUnexpected => 1,
    }
}

pub fn print_json_result(result: Result<serde_json::Value>) -> Result<()> {
    match result {
        Ok(data) => print_success(data),
        Err(err) => print_response(&CliResponse::<()>::from_error(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_code_and_hints() {
        let err = Error::application_not_found("app-1");
        let value = serde_json::to_value(CliResponse::<()>::from_error(&err)).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "application.not_found");
        assert!(value["error"]["hints"].is_array());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn exit_codes_group_by_family() {
        let (_, code) = map_cmd_result_to_json::<()>(Err(Error::run_not_found("r1")));
        assert_eq!(code, 4);
        assert_eq!(exit_code_for_error(ErrorCode::DispatchQuotaExceeded), 20);
        assert_eq!(exit_code_for_error(ErrorCode::WatchFetchFailed), 30);
        assert_eq!(exit_code_for_error(ErrorCode::ValidationInvalidJson), 2);
    }

    #[test]
    fn success_keeps_command_exit_code() {
        let (value, code) = map_cmd_result_to_json(Ok((serde_json::json!({"ok": true}), 20)));
        assert_eq!(value.unwrap()["ok"], true);
        assert_eq!(code, 20);
    }
}
