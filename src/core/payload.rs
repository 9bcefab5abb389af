//! Run payload carried as the body of an asynchronous invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::run::{RunPatch, RunStatus, RunSummary};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PayloadAuth {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunPayload {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pusher: Option<Value>,
    #[serde(default)]
    pub auth: PayloadAuth,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub custom_inputs: Map<String, Value>,
    /// Environment map as seen by the trigger; informational only, the worker
    /// never writes it back.
    #[serde(default)]
    pub environment: Map<String, Value>,
    #[serde(default)]
    pub env_name: String,
}

impl RunPayload {
    /// Decode an invocation body.
    ///
    /// Accepts a JSON object or a JSON string wrapping the object (bodies
    /// forwarded by some transports are double encoded).
    pub fn from_body(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::validation_invalid_json(e, Some("parse run payload".to_string())))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let value = match value {
            Value::String(inner) => serde_json::from_str(&inner).map_err(|e| {
                Error::validation_invalid_json(e, Some("parse nested run payload".to_string()))
            })?,
            other => other,
        };

        serde_json::from_value(value)
            .map_err(|e| Error::validation_invalid_json(e, Some("decode run payload".to_string())))
    }

    pub fn to_body(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize run payload".to_string())))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn summary(&self, status: RunStatus, completed: bool) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            commit: self.commit.clone(),
            message: self.message.clone(),
            git_ref: self.git_ref.clone(),
            completed,
            status,
        }
    }

    /// Initial checkpoint of a run triggered by this payload.
    pub fn created_patch(&self) -> RunPatch {
        RunPatch {
            env_name: Some(self.env_name.clone()),
            user_id: Some(self.auth.user_id.clone()),
            app_id: Some(self.auth.app_id.clone()),
            status: Some(RunStatus::Pending),
            trigger_payload: Some(self.to_value()),
            ..RunPatch::default()
        }
    }

    /// Console URL for this run, when a public domain is configured.
    pub fn run_url(&self, domain: Option<&str>) -> Option<String> {
        let domain = domain.map(|d| d.trim_end_matches('/')).filter(|d| !d.is_empty())?;
        Some(format!(
            "{}/application/{}/detail/{}/{}",
            domain, self.auth.user_id, self.env_name, self.run_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "run_id": "r1",
            "provider": "github",
            "clone_url": "https://github.com/acme/site.git",
            "auth": { "user_id": "u1", "owner": "acme", "app_id": "app-1", "secrets": {"TOKEN": "t"} },
            "ref": "refs/heads/main",
            "commit": "abc123",
            "message": "ship it",
            "event_name": "push",
            "env_name": "prod"
        })
    }

    #[test]
    fn decodes_plain_object() {
        let payload = RunPayload::from_value(sample()).unwrap();
        assert_eq!(payload.run_id, "r1");
        assert_eq!(payload.git_ref, "refs/heads/main");
        assert_eq!(payload.auth.secrets["TOKEN"], "t");
    }

    #[test]
    fn decodes_string_wrapped_body() {
        let wrapped = Value::String(sample().to_string());
        let payload = RunPayload::from_body(&wrapped.to_string()).unwrap();
        assert_eq!(payload.env_name, "prod");
    }

    #[test]
    fn run_url_requires_domain() {
        let payload = RunPayload::from_value(sample()).unwrap();
        assert_eq!(payload.run_url(None), None);
        assert_eq!(
            payload.run_url(Some("https://cd.example.com/")).as_deref(),
            Some("https://cd.example.com/application/u1/detail/prod/r1")
        );
    }

    #[test]
    fn created_patch_is_pending_with_trigger() {
        let payload = RunPayload::from_value(sample()).unwrap();
        let patch = payload.created_patch();
        assert_eq!(patch.status, Some(RunStatus::Pending));
        assert_eq!(patch.app_id.as_deref(), Some("app-1"));
        assert_eq!(patch.trigger_payload.unwrap()["run_id"], "r1");
        assert!(patch.completed.is_none());
    }

    #[test]
    fn summary_copies_git_context() {
        let payload = RunPayload::from_value(sample()).unwrap();
        let summary = payload.summary(RunStatus::Pending, false);
        assert_eq!(summary.commit, "abc123");
        assert_eq!(summary.message, "ship it");
        assert!(!summary.completed);
    }
}
