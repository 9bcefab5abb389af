//! Local process transport.
//!
//! Claims the idempotency token in the durable ledger, writes the invocation
//! body next to the store, then starts a detached `cdrun worker` process and
//! returns without waiting for it.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use super::{
    generate_request_id, Claim, InvocationLedger, InvocationReceipt, InvocationRequest,
    InvocationTransport,
};
use crate::error::{Error, ErrorCode, Result};
use crate::paths;
use crate::utils::io;

pub struct ProcessTransport {
    ledger: Arc<dyn InvocationLedger>,
    program: PathBuf,
    invocations_dir: PathBuf,
}

impl ProcessTransport {
    pub fn new(
        ledger: Arc<dyn InvocationLedger>,
        program: impl Into<PathBuf>,
        invocations_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            program: program.into(),
            invocations_dir: invocations_dir.into(),
        }
    }

    /// Transport that re-executes the running binary as the worker.
    pub fn current_exe(ledger: Arc<dyn InvocationLedger>) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            Error::internal_io(e.to_string(), Some("resolve current executable".to_string()))
        })?;
        Ok(Self::new(ledger, program, paths::invocations()?))
    }

    fn body_path(&self, token: &str) -> PathBuf {
        self.invocations_dir.join(format!("{}.json", token))
    }

    fn spawn_worker(&self, body_path: &Path) -> std::io::Result<()> {
        Command::new(&self.program)
            .arg("worker")
            .arg("--payload")
            .arg(format!("@{}", body_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_child| ())
    }
}

impl InvocationTransport for ProcessTransport {
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationReceipt> {
        let token = &request.headers.idempotency_token;
        let request_id = generate_request_id();

        if let Claim::Existing { request_id } = self.ledger.claim(token, &request_id)? {
            return Ok(InvocationReceipt {
                request_id,
                deduplicated: true,
            });
        }

        let body_path = self.body_path(token);
        let delivered = io::ensure_dir(&self.invocations_dir, "create invocations dir")
            .and_then(|_| io::write_file_atomic(&body_path, &request.body, "write invocation body"))
            .and_then(|_| {
                self.spawn_worker(&body_path).map_err(|e| {
                    Error::dispatch_failed(ErrorCode::DispatchRejected, token.clone(), None, e.to_string())
                })
            });

        if let Err(err) = delivered {
            if body_path.exists() {
                if let Err(e) = std::fs::remove_file(&body_path) {
                    log_status!("dispatch", "Could not remove {}: {}", body_path.display(), e);
                }
            }
            self.ledger.release(token)?;
            return Err(err);
        }

        Ok(InvocationReceipt {
            request_id,
            deduplicated: false,
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}
