//! Pipeline step execution.
//!
//! Steps run through the platform shell inside the run workspace. Each step
//! sees the run context as environment variables:
//!
//! | variable | value |
//! |---|---|
//! | `CDRUN_TASK_ID`, `CDRUN_TASK_URL` | run id and console URL |
//! | `CDRUN_APP_ID`, `CDRUN_USER_ID`, `CDRUN_ENV_NAME` | application context |
//! | `CDRUN_GIT_*` | owner, provider, clone url, ref, commit, branch, message, tag, event name, pusher |
//! | `CDRUN_INPUT_<NAME>` | custom trigger inputs |
//! | `<NAME>` | application secrets |
//!
//! The step's own `env` block is applied last. Combined output goes to
//! `<log_dir>/<step id>.log`.

use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, StepFailedDetails};
use crate::payload::RunPayload;
use crate::pipeline::PipelineStep;
use crate::run::{StepResult, StepStatus};
use crate::utils::{command, io};

/// Everything a step needs besides its own definition.
#[derive(Debug, Clone)]
pub struct StepInvocation<'a> {
    pub run_id: &'a str,
    pub workspace: &'a Path,
    pub log_dir: &'a Path,
    pub env: &'a [(String, String)],
    pub unset_envs: &'a [String],
}

#[derive(Debug, Clone)]
pub struct StepExecution {
    pub result: StepResult,
    pub error: Option<Error>,
}

pub trait StepExecutor: Send + Sync {
    /// Run one step to completion. Step failure is reported through
    /// `StepExecution::error`, never as `Err`.
    fn execute(&self, step: &PipelineStep, invocation: &StepInvocation<'_>) -> StepExecution;
}

#[derive(Debug, Clone, Default)]
pub struct ShellStepExecutor;

impl ShellStepExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the variables exported to every step of a run.
pub fn step_environment(payload: &RunPayload, domain: Option<&str>) -> Vec<(String, String)> {
    let optional = |v: &Option<String>| v.clone().unwrap_or_default();

    let mut env = vec![
        ("CDRUN_TASK_ID".to_string(), payload.run_id.clone()),
        (
            "CDRUN_TASK_URL".to_string(),
            payload.run_url(domain).unwrap_or_default(),
        ),
        ("CDRUN_APP_ID".to_string(), payload.auth.app_id.clone()),
        ("CDRUN_USER_ID".to_string(), payload.auth.user_id.clone()),
        ("CDRUN_ENV_NAME".to_string(), payload.env_name.clone()),
        ("CDRUN_GIT_OWNER".to_string(), payload.auth.owner.clone()),
        ("CDRUN_GIT_PROVIDER".to_string(), payload.provider.clone()),
        ("CDRUN_GIT_CLONE_URL".to_string(), payload.clone_url.clone()),
        ("CDRUN_GIT_REF".to_string(), payload.git_ref.clone()),
        ("CDRUN_GIT_COMMIT".to_string(), payload.commit.clone()),
        ("CDRUN_GIT_BRANCH".to_string(), optional(&payload.branch)),
        ("CDRUN_GIT_MESSAGE".to_string(), payload.message.clone()),
        ("CDRUN_GIT_TAG".to_string(), optional(&payload.tag)),
        ("CDRUN_GIT_EVENT_NAME".to_string(), payload.event_name.clone()),
        (
            "CDRUN_GIT_PUSHER".to_string(),
            payload.pusher.as_ref().map(value_text).unwrap_or_default(),
        ),
    ];

    for (name, value) in &payload.custom_inputs {
        env.push((format!("CDRUN_INPUT_{}", env_key(name)), value_text(value)));
    }

    for (name, value) in &payload.auth.secrets {
        env.push((name.clone(), value.clone()));
    }

    env
}

/// Log file for one step: `<log_dir>/<step id>.log`.
pub fn step_log_path(log_dir: &Path, step: &PipelineStep) -> PathBuf {
    log_dir.join(format!("{}.log", env_key(&step.id).to_lowercase()))
}

fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

impl StepExecutor for ShellStepExecutor {
    fn execute(&self, step: &PipelineStep, invocation: &StepInvocation<'_>) -> StepExecution {
        let started_at = Utc::now().to_rfc3339();

        let mut env = invocation.env.to_vec();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let workspace = invocation.workspace.to_string_lossy();
        let output = command::run_shell(&step.run, Some(&workspace), &env, invocation.unset_envs);

        let log_path = step_log_path(invocation.log_dir, step);
        let log_body = format!("$ {}\n{}{}", step.run, output.stdout, output.stderr);
        if let Err(err) = io::write_file(&log_path, &log_body, "write step log") {
            log_status!("worker", "Could not write {}: {}", log_path.display(), err.summary());
        }

        let finished_at = Some(Utc::now().to_rfc3339());

        if output.success {
            let summary = tail(&output.stdout, 5);
            return StepExecution {
                result: StepResult {
                    name: step.display_name().to_string(),
                    status: StepStatus::Succeeded,
                    started_at,
                    finished_at,
                    summary: (!summary.is_empty()).then_some(summary),
                },
                error: None,
            };
        }

        let stderr = tail(&output.stderr, 20);
        let error = Error::step_failed(StepFailedDetails {
            run_id: invocation.run_id.to_string(),
            step: step.id.clone(),
            exit_code: output.exit_code,
            stderr: stderr.clone(),
        });

        StepExecution {
            result: StepResult {
                name: step.display_name().to_string(),
                status: StepStatus::Failed,
                started_at,
                finished_at,
                summary: Some(if stderr.is_empty() { error.message.clone() } else { stderr }),
            },
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn step(id: &str, run: &str) -> PipelineStep {
        PipelineStep {
            id: id.to_string(),
            label: None,
            run: run.to_string(),
            needs: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    fn payload() -> RunPayload {
        let mut payload = RunPayload::from_value(json!({
            "run_id": "r7",
            "env_name": "prod",
            "commit": "abc",
            "auth": { "user_id": "u1", "app_id": "app-1", "secrets": { "DEPLOY_KEY": "s3cret" } },
            "custom_inputs": { "dry-run": true, "region": "eu" }
        }))
        .unwrap();
        payload.branch = Some("main".to_string());
        payload
    }

    #[test]
    fn environment_exports_run_git_inputs_and_secrets() {
        let env = step_environment(&payload(), Some("https://cd.example.com"));
        let get = |k: &str| env.iter().find(|(name, _)| name == k).map(|(_, v)| v.as_str());

        assert_eq!(get("CDRUN_TASK_ID"), Some("r7"));
        assert_eq!(
            get("CDRUN_TASK_URL"),
            Some("https://cd.example.com/application/u1/detail/prod/r7")
        );
        assert_eq!(get("CDRUN_GIT_BRANCH"), Some("main"));
        assert_eq!(get("CDRUN_INPUT_DRY_RUN"), Some("true"));
        assert_eq!(get("CDRUN_INPUT_REGION"), Some("eu"));
        assert_eq!(get("DEPLOY_KEY"), Some("s3cret"));
    }

    #[cfg(unix)]
    #[test]
    fn successful_step_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = step_environment(&payload(), None);
        let invocation = StepInvocation {
            run_id: "r7",
            workspace: dir.path(),
            log_dir: dir.path(),
            env: &env,
            unset_envs: &[],
        };
        let mut build = step("build", "echo building $CDRUN_TASK_ID for $TARGET");
        build.env.insert("TARGET".to_string(), "prod".to_string());

        let execution = ShellStepExecutor::new().execute(&build, &invocation);

        assert!(execution.error.is_none());
        assert_eq!(execution.result.status, StepStatus::Succeeded);
        assert_eq!(execution.result.summary.as_deref(), Some("building r7 for prod"));
        let log = std::fs::read_to_string(dir.path().join("build.log")).unwrap();
        assert!(log.contains("building r7 for prod"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_step_reports_step_failure() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = StepInvocation {
            run_id: "r7",
            workspace: dir.path(),
            log_dir: dir.path(),
            env: &[],
            unset_envs: &[],
        };

        let execution =
            ShellStepExecutor::new().execute(&step("test", "echo nope >&2; exit 2"), &invocation);
        let err = execution.error.unwrap();

        assert_eq!(err.code, crate::ErrorCode::RunStepFailed);
        assert_eq!(err.details["exitCode"], 2);
        assert_eq!(err.details["stderr"], "nope");
        assert_eq!(execution.result.status, StepStatus::Failed);
    }
}
