//! Asynchronous run dispatch.
//!
//! - [`Invoker`]: validates a run request and hands it to a transport
//! - [`InvocationTransport`]: fire-and-forget delivery to a worker host
//! - [`InvocationLedger`]: idempotency-token bookkeeping used by the local
//!   transports (remote transports deduplicate server side)
//!
//! The run id is the idempotency token. A second dispatch with the same id is
//! accepted but reported as deduplicated and never starts another lifecycle.

pub mod http;
pub mod memory;
pub mod process;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::defaults::{DispatchConfig, TransportKind};
use crate::error::{Error, Result};
use crate::orchestrator::{CompletionSignal, RunOutcome};
use crate::payload::RunPayload;

pub use http::HttpTransport;
pub use memory::{InProcessTransport, MemoryLedger};
pub use process::ProcessTransport;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvocationType {
    Async,
}

impl InvocationType {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationType::Async => "Async",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationHeaders {
    pub invocation_type: InvocationType,
    pub idempotency_token: String,
}

/// One call to the worker host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub service_id: String,
    pub function_id: String,
    pub body: String,
    pub headers: InvocationHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReceipt {
    pub request_id: String,
    pub deduplicated: bool,
}

pub trait InvocationTransport: Send + Sync {
    /// Hand the request over and return once the transport has accepted it.
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationReceipt>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    New,
    Existing { request_id: String },
}

/// Durable record of which idempotency tokens have been accepted.
pub trait InvocationLedger: Send + Sync {
    /// Record `token`, or report the request that already holds it.
    fn claim(&self, token: &str, request_id: &str) -> Result<Claim>;

    /// Forget a claim whose delivery failed before the worker started.
    fn release(&self, token: &str) -> Result<()>;

    fn complete(&self, token: &str, status: &str) -> Result<()>;

    fn status(&self, token: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub run_id: String,
    pub request_id: String,
    pub deduplicated: bool,
    pub transport: String,
    pub dispatched_at: DateTime<Utc>,
}

/// Synchronous entry point that hands runs to a worker host.
pub struct Invoker {
    transport: Arc<dyn InvocationTransport>,
    service_id: String,
    function_id: String,
}

impl Invoker {
    pub fn new(
        transport: Arc<dyn InvocationTransport>,
        service_id: impl Into<String>,
        function_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            service_id: service_id.into(),
            function_id: function_id.into(),
        }
    }

    pub fn from_config(config: &DispatchConfig, transport: Arc<dyn InvocationTransport>) -> Self {
        Self::new(transport, &config.service_id, &config.function_id)
    }

    /// Dispatch a run without waiting for it to execute.
    ///
    /// Nothing is written to the run record store here; the worker creates the
    /// record when it starts.
    pub fn dispatch(&self, payload: &RunPayload) -> Result<DispatchResult> {
        validate_run_id(&payload.run_id)?;

        let request = InvocationRequest {
            service_id: self.service_id.clone(),
            function_id: self.function_id.clone(),
            body: payload.to_body()?,
            headers: InvocationHeaders {
                invocation_type: InvocationType::Async,
                idempotency_token: payload.run_id.clone(),
            },
        };

        log_status!(
            "dispatch",
            "Dispatching run {} via {} transport",
            payload.run_id,
            self.transport.name()
        );

        let receipt = self.transport.invoke(&request)?;

        if receipt.deduplicated {
            log_status!(
                "dispatch",
                "Run {} was already dispatched (request {})",
                payload.run_id,
                receipt.request_id
            );
        }

        Ok(DispatchResult {
            run_id: payload.run_id.clone(),
            request_id: receipt.request_id,
            deduplicated: receipt.deduplicated,
            transport: self.transport.name().to_string(),
            dispatched_at: Utc::now(),
        })
    }
}

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("run id pattern compiles")
    })
}

/// Run ids double as file names and idempotency tokens.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.trim().is_empty() {
        return Err(Error::validation_missing_argument(vec!["run_id".to_string()]));
    }
    if !run_id_pattern().is_match(run_id) {
        return Err(Error::validation_invalid_argument(
            "run_id",
            "Run id must be 1-128 characters of letters, digits, '.', '_' or '-'",
            Some(run_id.to_string()),
            None,
        ));
    }
    Ok(())
}

pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Completion callback that closes the ledger entry for an invocation.
pub struct LedgerCompletion {
    ledger: Arc<dyn InvocationLedger>,
    token: String,
}

impl LedgerCompletion {
    pub fn new(ledger: Arc<dyn InvocationLedger>, token: impl Into<String>) -> Self {
        Self {
            ledger,
            token: token.into(),
        }
    }
}

impl CompletionSignal for LedgerCompletion {
    fn complete(&self, outcome: &RunOutcome) {
        if let Err(err) = self.ledger.complete(&self.token, outcome.status.as_str()) {
            log_status!(
                "worker",
                "Failed to close invocation {}: {}",
                self.token,
                err.summary()
            );
        }
    }
}

/// Build the transport named by configuration.
pub fn build_transport(
    config: &DispatchConfig,
    ledger: Arc<dyn InvocationLedger>,
) -> Result<Arc<dyn InvocationTransport>> {
    match config.transport {
        TransportKind::Process => Ok(Arc::new(ProcessTransport::current_exe(ledger)?)),
        TransportKind::Http => Ok(Arc::new(HttpTransport::from_config(config)?)),
    }
}
