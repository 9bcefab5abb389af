//! In-process transport and ledger.
//!
//! Runs each accepted invocation on its own thread inside the calling
//! process. Useful for embedding the worker in another service and for tests;
//! accepted tokens are only remembered for the lifetime of the ledger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::{
    generate_request_id, Claim, InvocationLedger, InvocationReceipt, InvocationRequest,
    InvocationTransport,
};
use crate::error::{Error, ErrorCode, Result};

#[derive(Debug, Clone)]
struct LedgerEntry {
    request_id: String,
    status: String,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InvocationLedger for MemoryLedger {
    fn claim(&self, token: &str, request_id: &str) -> Result<Claim> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get(token) {
            return Ok(Claim::Existing {
                request_id: entry.request_id.clone(),
            });
        }
        entries.insert(
            token.to_string(),
            LedgerEntry {
                request_id: request_id.to_string(),
                status: "accepted".to_string(),
            },
        );
        Ok(Claim::New)
    }

    fn release(&self, token: &str) -> Result<()> {
        let mut entries = self.entries();
        if entries.get(token).is_some_and(|e| e.status == "accepted") {
            entries.remove(token);
        }
        Ok(())
    }

    fn complete(&self, token: &str, status: &str) -> Result<()> {
        if let Some(entry) = self.entries().get_mut(token) {
            entry.status = status.to_string();
        }
        Ok(())
    }

    fn status(&self, token: &str) -> Result<Option<String>> {
        Ok(self.entries().get(token).map(|e| e.status.clone()))
    }
}

pub type InvocationHandler = Arc<dyn Fn(InvocationRequest) + Send + Sync>;

pub struct InProcessTransport {
    ledger: Arc<dyn InvocationLedger>,
    handler: InvocationHandler,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InProcessTransport {
    pub fn new(ledger: Arc<dyn InvocationLedger>, handler: InvocationHandler) -> Self {
        Self {
            ledger,
            handler,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Block until every invocation started so far has returned.
    pub fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                log_status!("dispatch", "An in-process invocation panicked");
            }
        }
    }
}

impl InvocationTransport for InProcessTransport {
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationReceipt> {
        let token = &request.headers.idempotency_token;
        let request_id = generate_request_id();

        if let Claim::Existing { request_id } = self.ledger.claim(token, &request_id)? {
            return Ok(InvocationReceipt {
                request_id,
                deduplicated: true,
            });
        }

        let handler = Arc::clone(&self.handler);
        let owned = request.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("cdrun-run-{}", token))
            .spawn(move || handler(owned));

        match spawned {
            Ok(handle) => {
                self.workers
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(handle);
                Ok(InvocationReceipt {
                    request_id,
                    deduplicated: false,
                })
            }
            Err(e) => {
                self.ledger.release(token)?;
                Err(Error::dispatch_failed(
                    ErrorCode::DispatchRejected,
                    token.clone(),
                    None,
                    e.to_string(),
                ))
            }
        }
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}
