//! Observer: follow an environment's latest run by polling its Application
//! document until the run is terminal.
//!
//! Convergence rules, applied to every fetched document:
//!
//! - fetch error, missing application, non-object document or missing
//!   environment: stop with [`WatchOutcome::Failed`]
//! - `latest_task.completed` is `false`: report an update and keep polling
//! - anything else (`true`, absent, not a boolean, no `latest_task`): stop
//!   with [`WatchOutcome::Completed`]
//!
//! Unknown shapes therefore stop the loop instead of polling forever.
//! Cancellation is cooperative: the token is checked before every fetch, and
//! a fetch that returns after cancellation is discarded.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::defaults::ObserverConfig;
use crate::error::{Error, ErrorCode, Result};

/// Anything that can return the current Application document.
pub trait ApplicationSource: Send + Sync {
    /// `Ok(None)` when the application does not exist.
    fn fetch_application(&self, app_id: &str) -> Result<Option<Value>>;
}

/// The latest-run pointer as seen by one poll. Fields are read leniently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedRun {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    pub latest_task: Value,
}

impl ObservedRun {
    fn from_latest_task(latest_task: &Value) -> Self {
        let text = |key: &str| latest_task.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            run_id: text("run_id"),
            status: text("status"),
            completed: latest_task.get("completed").and_then(Value::as_bool),
            latest_task: latest_task.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WatchOutcome {
    /// The environment has no unfinished run. `None` when it has no run at all.
    Completed(Option<ObservedRun>),
    Failed(Error),
}

#[derive(Debug, Clone)]
pub enum Evaluation {
    Continue(ObservedRun),
    Terminal(WatchOutcome),
}

/// Apply the convergence rules to one fetch result.
pub fn evaluate(app_id: &str, env_name: &str, fetched: Result<Option<Value>>) -> Evaluation {
    let doc = match fetched {
        Ok(Some(doc)) => doc,
        Ok(None) => return Evaluation::Terminal(WatchOutcome::Failed(Error::application_not_found(app_id))),
        Err(err) if err.code == ErrorCode::WatchFetchFailed => {
            return Evaluation::Terminal(WatchOutcome::Failed(err))
        }
        Err(err) => {
            return Evaluation::Terminal(WatchOutcome::Failed(Error::watch_fetch_failed(
                app_id,
                err.summary(),
            )))
        }
    };

    if !doc.is_object() {
        return Evaluation::Terminal(WatchOutcome::Failed(Error::watch_malformed_state(
            app_id,
            "application document is not an object",
        )));
    }

    let Some(environment) = doc
        .get("environment")
        .and_then(|envs| envs.get(env_name))
        .filter(|env| env.is_object())
    else {
        return Evaluation::Terminal(WatchOutcome::Failed(Error::environment_not_found(app_id, env_name)));
    };

    let latest_task = match environment.get("latest_task") {
        None | Some(Value::Null) => return Evaluation::Terminal(WatchOutcome::Completed(None)),
        Some(latest_task) => latest_task,
    };

    let observed = ObservedRun::from_latest_task(latest_task);
    match latest_task.get("completed") {
        Some(Value::Bool(false)) => Evaluation::Continue(observed),
        _ => Evaluation::Terminal(WatchOutcome::Completed(Some(observed))),
    }
}

/// Explicit cancellation flag shared between a watch and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep up to `timeout`, waking early on cancellation. Returns whether the
    /// token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = match signal.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *cancelled
    }
}

/// Poll on the calling thread. Returns `None` when cancelled.
pub fn watch_blocking(
    source: &dyn ApplicationSource,
    app_id: &str,
    env_name: &str,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_update: impl FnMut(&ObservedRun),
) -> Option<WatchOutcome> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let fetched = source.fetch_application(app_id);
        if cancel.is_cancelled() {
            return None;
        }

        match evaluate(app_id, env_name, fetched) {
            Evaluation::Terminal(outcome) => return Some(outcome),
            Evaluation::Continue(observed) => on_update(&observed),
        }

        if cancel.wait_timeout(interval) {
            return None;
        }
    }
}

/// Handle to a background watch.
pub struct WatchHandle {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stop polling. `on_terminal` is not called after this returns, unless it
    /// was already running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the polling thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log_status!("watch", "Watch thread panicked");
            }
        }
    }
}

/// Poll on a background thread.
///
/// `on_update` receives every non-terminal observation; `on_terminal` is
/// called at most once, and never after cancellation.
pub fn watch<U, T>(
    source: Arc<dyn ApplicationSource>,
    app_id: impl Into<String>,
    env_name: impl Into<String>,
    interval: Duration,
    on_update: U,
    on_terminal: T,
) -> Result<WatchHandle>
where
    U: FnMut(&ObservedRun) + Send + 'static,
    T: FnOnce(WatchOutcome) + Send + 'static,
{
    let app_id = app_id.into();
    let env_name = env_name.into();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let thread = std::thread::Builder::new()
        .name(format!("cdrun-watch-{}", app_id))
        .spawn(move || {
            let outcome = watch_blocking(source.as_ref(), &app_id, &env_name, interval, &token, on_update);
            if let Some(outcome) = outcome {
                if !token.is_cancelled() {
                    on_terminal(outcome);
                }
            }
        })
        .map_err(|e| Error::internal_unexpected(format!("spawn watch thread: {}", e)))?;

    Ok(WatchHandle {
        cancel,
        thread: Some(thread),
    })
}

/// Reads Application documents from the management API:
/// `GET {base}/application/{appId}` answering `{ "success": bool, "data": {..} }`.
pub struct HttpApplicationSource {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpApplicationSource {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::config_invalid_value(
                "defaults.observer.api_base_url",
                None,
                "Observer API base URL is empty",
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_unexpected(format!("build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            bearer_token,
        })
    }

    /// Source for `config.api_base_url`, if one is configured. The bearer
    /// token is read from the variable named by `config.access_token_env`.
    pub fn from_config(config: &ObserverConfig) -> Result<Option<Self>> {
        let Some(url) = config.api_base_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let token = config
            .access_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty());
        Ok(Some(Self::new(url, token, Duration::from_secs(30))?))
    }

    pub fn application_url(&self, app_id: &str) -> String {
        format!("{}/application/{}", self.base_url, app_id)
    }
}

/// Unwrap the `{ success, data }` envelope of the management API.
pub fn parse_envelope(app_id: &str, body: Value) -> Result<Option<Value>> {
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(body.get("data").cloned().filter(|d| !d.is_null())),
        Some(false) => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request was not successful");
            Err(Error::watch_fetch_failed(app_id, message))
        }
        None => Err(Error::watch_malformed_state(app_id, "response has no success flag")),
    }
}

impl ApplicationSource for HttpApplicationSource {
    fn fetch_application(&self, app_id: &str) -> Result<Option<Value>> {
        let mut request = self.client.get(self.application_url(app_id));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| Error::watch_fetch_failed(app_id, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::watch_fetch_failed(app_id, format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .map_err(|e| Error::watch_malformed_state(app_id, e.to_string()))?;
        parse_envelope(app_id, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn app_with(latest_task: Value) -> Value {
        json!({
            "app_id": "app-1",
            "environment": { "envA": { "secrets": {}, "latest_task": latest_task } }
        })
    }

    fn running() -> Value {
        app_with(json!({ "run_id": "r1", "status": "running", "completed": false }))
    }

    fn finished() -> Value {
        app_with(json!({ "run_id": "r1", "status": "failed", "completed": true }))
    }

    /// Replays a fixed list of fetch results, repeating the last one.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Option<Value>>>>,
        fetches: AtomicUsize,
        cancel_on_fetch: Option<CancellationToken>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Option<Value>>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fetches: AtomicUsize::new(0),
                cancel_on_fetch: None,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl ApplicationSource for ScriptedSource {
        fn fetch_application(&self, _app_id: &str) -> Result<Option<Value>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_fetch {
                token.cancel();
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            }
        }
    }

    fn is_completed(e: &Evaluation) -> bool {
        matches!(e, Evaluation::Terminal(WatchOutcome::Completed(_)))
    }

    #[test]
    fn completed_false_keeps_polling() {
        match evaluate("app-1", "envA", Ok(Some(running()))) {
            Evaluation::Continue(observed) => {
                assert_eq!(observed.run_id.as_deref(), Some("r1"));
                assert_eq!(observed.status.as_deref(), Some("running"));
            }
            other => panic!("expected continue, got {:?}", other),
        }
    }

    #[test]
    fn completed_true_is_terminal() {
        assert!(is_completed(&evaluate("app-1", "envA", Ok(Some(finished())))));
    }

    #[test]
    fn absent_or_non_boolean_completed_is_terminal() {
        let absent = app_with(json!({ "run_id": "r1", "status": "running" }));
        let text = app_with(json!({ "run_id": "r1", "completed": "false" }));
        let number = app_with(json!({ "run_id": "r1", "completed": 0 }));
        let scalar = app_with(json!("r1"));

        for doc in [absent, text, number, scalar] {
            assert!(is_completed(&evaluate("app-1", "envA", Ok(Some(doc)))));
        }
    }

    #[test]
    fn environment_without_runs_is_terminal() {
        let doc = json!({ "app_id": "app-1", "environment": { "envA": { "secrets": {} } } });
        assert!(matches!(
            evaluate("app-1", "envA", Ok(Some(doc))),
            Evaluation::Terminal(WatchOutcome::Completed(None))
        ));
    }

    #[test]
    fn missing_or_invalid_documents_fail() {
        let code = |fetched: Result<Option<Value>>| match evaluate("app-1", "envA", fetched) {
            Evaluation::Terminal(WatchOutcome::Failed(err)) => err.code,
            other => panic!("expected failure, got {:?}", other),
        };

        assert_eq!(code(Ok(None)), ErrorCode::ApplicationNotFound);
        assert_eq!(code(Ok(Some(json!([1, 2])))), ErrorCode::WatchMalformedState);
        assert_eq!(
            code(Ok(Some(json!({ "environment": { "envB": {} } })))),
            ErrorCode::EnvironmentNotFound
        );
        assert_eq!(
            code(Err(Error::store_read("read application", "disk I/O error"))),
            ErrorCode::WatchFetchFailed
        );
    }

    #[test]
    fn watch_stops_on_first_terminal_document() {
        let source = ScriptedSource::new(vec![
            Ok(Some(running())),
            Ok(Some(running())),
            Ok(Some(finished())),
            Ok(Some(running())),
        ]);
        let mut updates = 0;

        let outcome = watch_blocking(
            &source,
            "app-1",
            "envA",
            Duration::from_millis(1),
            &CancellationToken::new(),
            |_| updates += 1,
        );

        assert!(matches!(outcome, Some(WatchOutcome::Completed(Some(_)))));
        assert_eq!(updates, 2);
        assert_eq!(source.fetches(), 3);
    }

    #[test]
    fn fetch_failure_stops_immediately() {
        let source = ScriptedSource::new(vec![Err(Error::watch_fetch_failed("app-1", "timeout"))]);

        let outcome = watch_blocking(
            &source,
            "app-1",
            "envA",
            Duration::from_millis(1),
            &CancellationToken::new(),
            |_| panic!("no updates expected"),
        );

        assert!(matches!(outcome, Some(WatchOutcome::Failed(_))));
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn result_of_fetch_in_flight_at_cancel_is_discarded() {
        let token = CancellationToken::new();
        let mut source = ScriptedSource::new(vec![Ok(Some(finished()))]);
        source.cancel_on_fetch = Some(token.clone());

        let outcome = watch_blocking(&source, "app-1", "envA", Duration::from_secs(5), &token, |_| {});

        assert!(outcome.is_none());
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn cancelled_background_watch_never_reports_terminal() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(Some(running()))]));
        let (tx, rx) = mpsc::channel();
        let (update_tx, update_rx) = mpsc::channel();

        let handle = watch(
            source.clone(),
            "app-1",
            "envA",
            Duration::from_secs(60),
            move |observed| {
                let _ = update_tx.send(observed.clone());
            },
            move |outcome| {
                let _ = tx.send(outcome);
            },
        )
        .unwrap();

        update_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.cancel();
        handle.join();

        assert!(rx.try_recv().is_err());
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn background_watch_reports_terminal_once() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(Some(running())), Ok(Some(finished()))]));
        let (tx, rx) = mpsc::channel();

        let handle = watch(
            source,
            "app-1",
            "envA",
            Duration::from_millis(1),
            |_| {},
            move |outcome| {
                let _ = tx.send(outcome);
            },
        )
        .unwrap();
        handle.join();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, WatchOutcome::Completed(Some(ref run)) if run.completed == Some(true)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancellation_wakes_sleeping_wait() {
        let token = CancellationToken::new();
        let other = token.clone();
        let started = Instant::now();
        let waiter = std::thread::spawn(move || other.wait_timeout(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(20));
        token.cancel();

        assert!(waiter.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn envelope_parsing() {
        assert_eq!(
            parse_envelope("app-1", json!({ "success": true, "data": { "app_id": "app-1" } })).unwrap(),
            Some(json!({ "app_id": "app-1" }))
        );
        assert_eq!(parse_envelope("app-1", json!({ "success": true, "data": null })).unwrap(), None);
        assert_eq!(
            parse_envelope("app-1", json!({ "success": false, "message": "gone" }))
                .unwrap_err()
                .code,
            ErrorCode::WatchFetchFailed
        );
        assert_eq!(
            parse_envelope("app-1", json!({ "data": {} })).unwrap_err().code,
            ErrorCode::WatchMalformedState
        );
    }

    #[test]
    fn http_source_reads_token_from_configured_variable() {
        std::env::set_var("CDRUN_TEST_OBSERVER_TOKEN", "tok-1");
        let config = ObserverConfig {
            interval_ms: 1000,
            api_base_url: Some("https://cd.example.com/api/".to_string()),
            access_token_env: Some("CDRUN_TEST_OBSERVER_TOKEN".to_string()),
        };

        let source = HttpApplicationSource::from_config(&config).unwrap().unwrap();

        assert_eq!(source.bearer_token.as_deref(), Some("tok-1"));
        assert_eq!(
            source.application_url("app-1"),
            "https://cd.example.com/api/application/app-1"
        );
    }

    #[test]
    fn http_source_is_absent_without_base_url() {
        let config = ObserverConfig {
            interval_ms: 1000,
            api_base_url: None,
            access_token_env: Some("CDRUN_TEST_OBSERVER_TOKEN".to_string()),
        };
        assert!(HttpApplicationSource::from_config(&config).unwrap().is_none());
    }
}
