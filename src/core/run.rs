//! Run, step and application document types.
//!
//! `Run` is the checkpointed record of one pipeline execution. `RunSummary`
//! is the cached pointer stored on `environment[env].latest_task` so that
//! observers can follow an environment without knowing the run id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Run {
    pub run_id: String,
    #[serde(default)]
    pub env_name: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub trigger_payload: Value,
}

/// Partial run state written by one checkpoint.
///
/// Absent fields keep their stored value; `steps`, when present, replaces the
/// whole list.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<Value>,
}

impl RunPatch {
    pub fn progress(status: RunStatus, steps: &[StepResult]) -> Self {
        Self {
            status: Some(status),
            steps: Some(steps.to_vec()),
            ..Self::default()
        }
    }
}

/// Latest-run pointer cached on an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    pub completed: bool,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Environment {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub trigger_spec: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_task: Option<RunSummary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Application {
    pub app_id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub environment: BTreeMap<String, Environment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
