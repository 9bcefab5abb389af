//! Run record store.
//!
//! Two document families live here: Run records keyed by `run_id`, and
//! Application documents keyed by `app_id` with nested per-environment state.
//! Every write is a merge against the latest stored copy; nothing is cached in
//! memory across calls. Repeating a write whose merged result equals the stored
//! document is reported as `Unchanged` and leaves the row untouched.
//!
//! The SQLite implementation uses immediate transactions for each
//! read-modify-write, so concurrent writers to different fields of one
//! Application document never lose each other's updates.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::defaults::StoreConfig;
use crate::error::{Error, Result};
use crate::json;
use crate::paths;
use crate::run::{Run, RunPatch, RunSummary};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LeaseOutcome {
    Acquired,
    Busy { holder_run_id: String },
}

/// Contract between the worker, the observer and durable storage.
pub trait RunStore: Send + Sync {
    /// Merge a checkpoint into the run record, creating it if needed.
    fn upsert_run(&self, run_id: &str, patch: &RunPatch) -> Result<WriteOutcome>;

    /// Write `patch` as a new run record only when `run_id` has none yet.
    /// An existing record is left as stored and reported `Unchanged`.
    fn create_run(&self, run_id: &str, patch: &RunPatch) -> Result<WriteOutcome>;

    fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Replace `environment[env_name].latest_task`, leaving every sibling
    /// field of the Application document as stored.
    fn merge_environment_latest_run(
        &self,
        app_id: &str,
        env_name: &str,
        summary: &RunSummary,
    ) -> Result<WriteOutcome>;

    fn get_application(&self, app_id: &str) -> Result<Option<Value>>;

    /// Store a full Application document. Returns the new version.
    fn put_application(&self, doc: &Value) -> Result<u64>;

    /// Deep-merge a partial document into an existing Application.
    fn update_application(&self, app_id: &str, patch: Value) -> Result<u64>;

    fn acquire_environment_lease(
        &self,
        app_id: &str,
        env_name: &str,
        run_id: &str,
    ) -> Result<LeaseOutcome>;

    fn release_environment_lease(&self, app_id: &str, env_name: &str, run_id: &str) -> Result<()>;
}

pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_doc(raw: &str, operation: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::store_read(operation, e))
}

fn encode_doc(doc: &Value, operation: &str) -> Result<String> {
    serde_json::to_string(doc).map_err(|e| Error::store_write(operation, e))
}

impl SqliteRunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| Error::store_read("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::store_read("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| Error::store_read("set synchronous", e))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::store_read("open sqlite db", e))?;
        Self::from_connection(conn)
    }

    /// Open the store named by configuration (default `<cdrun home>/runs.sqlite3`).
    pub fn open_configured(config: &StoreConfig) -> Result<Self> {
        let path = paths::resolve_or(config.path.as_deref(), paths::store_db)?;
        Self::open(path)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::store_read("set busy_timeout", e))?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_tx<T>(
        &self,
        operation: &str,
        body: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::store_write(operation, e))?;
        let value = body(&tx)?;
        tx.commit().map_err(|e| Error::store_write(operation, e))?;
        Ok(value)
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            digest TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS applications (
            app_id TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS env_leases (
            app_id TEXT NOT NULL,
            env_name TEXT NOT NULL,
            run_id TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            PRIMARY KEY (app_id, env_name)
        );
        CREATE TABLE IF NOT EXISTS invocations (
            token TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            status TEXT NOT NULL,
            accepted_at TEXT NOT NULL,
            completed_at TEXT
        );
        ",
    )
    .map_err(|e| Error::store_write("ensure schema", e))
}

fn read_application(tx: &Connection, app_id: &str) -> Result<Option<(Value, u64)>> {
    let row: Option<(String, i64)> = tx
        .query_row(
            "SELECT doc, version FROM applications WHERE app_id = ?1",
            params![app_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| Error::store_read("read application", e))?;

    match row {
        Some((raw, version)) => Ok(Some((parse_doc(&raw, "decode application")?, version as u64))),
        None => Ok(None),
    }
}

fn write_application(tx: &Connection, app_id: &str, doc: &Value, version: u64) -> Result<()> {
    let raw = encode_doc(doc, "encode application")?;
    tx.execute(
        "INSERT INTO applications (app_id, doc, version, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(app_id) DO UPDATE SET doc = excluded.doc, version = excluded.version,
         updated_at = excluded.updated_at",
        params![app_id, raw, version as i64, now()],
    )
    .map_err(|e| Error::store_write("write application", e))?;
    Ok(())
}

fn run_completed(tx: &Connection, run_id: &str) -> Result<bool> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT doc FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::store_read("read run", e))?;

    Ok(match raw {
        Some(raw) => parse_doc(&raw, "decode run")?
            .get("completed")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        None => false,
    })
}

/// Checkpoint fields replace their stored values whole; nested payloads are
/// kept exactly as written.
fn apply_run_patch(doc: &mut Value, run_id: &str, patch: Value) {
    if !doc.is_object() {
        *doc = json!({});
    }
    if let Value::Object(map) = doc {
        if let Value::Object(fields) = patch {
            map.extend(fields);
        }
        map.insert("run_id".to_string(), Value::String(run_id.to_string()));
    }
}

impl RunStore for SqliteRunStore {
    fn upsert_run(&self, run_id: &str, patch: &RunPatch) -> Result<WriteOutcome> {
        let patch = serde_json::to_value(patch).map_err(|e| Error::store_write("encode run patch", e))?;

        self.write_tx("upsert run", |tx| {
            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT doc, digest FROM runs WHERE run_id = ?1",
                    params![run_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| Error::store_read("read run", e))?;

            let (mut doc, stored_digest) = match existing {
                Some((raw, digest)) => (parse_doc(&raw, "decode run")?, Some(digest)),
                None => (json!({ "run_id": run_id }), None),
            };

            apply_run_patch(&mut doc, run_id, patch);

            let digest = json::digest(&doc);
            if stored_digest.as_deref() == Some(digest.as_str()) {
                return Ok(WriteOutcome::Unchanged);
            }

            tx.execute(
                "INSERT INTO runs (run_id, doc, digest, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET doc = excluded.doc, digest = excluded.digest,
                 updated_at = excluded.updated_at",
                params![run_id, encode_doc(&doc, "encode run")?, digest, now()],
            )
            .map_err(|e| Error::store_write("write run", e))?;

            Ok(WriteOutcome::Written)
        })
    }

    fn create_run(&self, run_id: &str, patch: &RunPatch) -> Result<WriteOutcome> {
        let patch = serde_json::to_value(patch).map_err(|e| Error::store_write("encode run patch", e))?;
        let mut doc = json!({});
        apply_run_patch(&mut doc, run_id, patch);
        let raw = encode_doc(&doc, "encode run")?;
        let digest = json::digest(&doc);

        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT INTO runs (run_id, doc, digest, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO NOTHING",
                params![run_id, raw, digest, now()],
            )
            .map_err(|e| Error::store_write("create run", e))?;

        Ok(if inserted == 0 {
            WriteOutcome::Unchanged
        } else {
            WriteOutcome::Written
        })
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT doc FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::store_read("read run", e))?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::store_read("decode run", e)),
            None => Ok(None),
        }
    }

    fn merge_environment_latest_run(
        &self,
        app_id: &str,
        env_name: &str,
        summary: &RunSummary,
    ) -> Result<WriteOutcome> {
        let summary =
            serde_json::to_value(summary).map_err(|e| Error::store_write("encode summary", e))?;

        self.write_tx("merge latest run", |tx| {
            let (mut doc, version) =
                read_application(tx, app_id)?.ok_or_else(|| Error::application_not_found(app_id))?;

            let root = doc.as_object_mut().ok_or_else(|| {
                Error::store_read("merge latest run", "application document is not an object")
            })?;
            let environments = root
                .entry("environment")
                .or_insert_with(|| Value::Object(Map::new()));
            if !environments.is_object() {
                *environments = Value::Object(Map::new());
            }
            let environment = environments
                .as_object_mut()
                .map(|envs| envs.entry(env_name).or_insert_with(|| Value::Object(Map::new())))
                .ok_or_else(|| Error::internal_unexpected("environment map vanished"))?;
            let environment = environment.as_object_mut().ok_or_else(|| {
                Error::store_read("merge latest run", format!("environment '{}' is not an object", env_name))
            })?;

            if environment.get("latest_task") == Some(&summary) {
                return Ok(WriteOutcome::Unchanged);
            }
            environment.insert("latest_task".to_string(), summary);

            write_application(tx, app_id, &doc, version + 1)?;
            Ok(WriteOutcome::Written)
        })
    }

    fn get_application(&self, app_id: &str) -> Result<Option<Value>> {
        let conn = self.lock();
        Ok(read_application(&conn, app_id)?.map(|(doc, _)| doc))
    }

    fn put_application(&self, doc: &Value) -> Result<u64> {
        let app_id = doc
            .get("app_id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::validation_invalid_argument("app_id", "Application document needs an app_id", None, None)
            })?
            .to_string();

        self.write_tx("put application", |tx| {
            let version = match read_application(tx, &app_id)? {
                Some((existing, version)) if &existing == doc => return Ok(version),
                Some((_, version)) => version + 1,
                None => 1,
            };
            write_application(tx, &app_id, doc, version)?;
            Ok(version)
        })
    }

    fn update_application(&self, app_id: &str, patch: Value) -> Result<u64> {
        if !patch.is_object() {
            return Err(Error::validation_invalid_argument(
                "patch",
                "Application patch must be a JSON object",
                None,
                None,
            ));
        }

        self.write_tx("update application", |tx| {
            let (mut doc, version) =
                read_application(tx, app_id)?.ok_or_else(|| Error::application_not_found(app_id))?;
            let before = doc.clone();

            json::deep_merge(&mut doc, patch);
            if let Value::Object(map) = &mut doc {
                map.insert("app_id".to_string(), Value::String(app_id.to_string()));
            }

            if doc == before {
                return Ok(version);
            }
            write_application(tx, app_id, &doc, version + 1)?;
            Ok(version + 1)
        })
    }

    fn acquire_environment_lease(
        &self,
        app_id: &str,
        env_name: &str,
        run_id: &str,
    ) -> Result<LeaseOutcome> {
        self.write_tx("acquire lease", |tx| {
            let holder: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM env_leases WHERE app_id = ?1 AND env_name = ?2",
                    params![app_id, env_name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::store_read("read lease", e))?;

            if let Some(holder) = holder {
                // A finished holder that never released (worker died after its
                // terminal checkpoint) does not block the environment.
                if holder != run_id && !run_completed(tx, &holder)? {
                    return Ok(LeaseOutcome::Busy {
                        holder_run_id: holder,
                    });
                }
            }

            tx.execute(
                "INSERT INTO env_leases (app_id, env_name, run_id, acquired_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(app_id, env_name) DO UPDATE SET run_id = excluded.run_id,
                 acquired_at = excluded.acquired_at",
                params![app_id, env_name, run_id, now()],
            )
            .map_err(|e| Error::store_write("write lease", e))?;

            Ok(LeaseOutcome::Acquired)
        })
    }

    fn release_environment_lease(&self, app_id: &str, env_name: &str, run_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM env_leases WHERE app_id = ?1 AND env_name = ?2 AND run_id = ?3",
            params![app_id, env_name, run_id],
        )
        .map_err(|e| Error::store_write("release lease", e))?;
        Ok(())
    }
}

impl crate::dispatch::InvocationLedger for SqliteRunStore {
    fn claim(&self, token: &str, request_id: &str) -> Result<crate::dispatch::Claim> {
        self.write_tx("claim invocation", |tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT request_id FROM invocations WHERE token = ?1",
                    params![token],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| Error::store_read("read invocation", e))?;

            if let Some(request_id) = existing {
                return Ok(crate::dispatch::Claim::Existing { request_id });
            }

            tx.execute(
                "INSERT INTO invocations (token, request_id, status, accepted_at) VALUES (?1, ?2, 'accepted', ?3)",
                params![token, request_id, now()],
            )
            .map_err(|e| Error::store_write("write invocation", e))?;
            Ok(crate::dispatch::Claim::New)
        })
    }

    fn release(&self, token: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM invocations WHERE token = ?1 AND status = 'accepted'",
            params![token],
        )
        .map_err(|e| Error::store_write("release invocation", e))?;
        Ok(())
    }

    fn complete(&self, token: &str, status: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE invocations SET status = ?2, completed_at = ?3 WHERE token = ?1",
            params![token, status, now()],
        )
        .map_err(|e| Error::store_write("complete invocation", e))?;
        Ok(())
    }

    fn status(&self, token: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT status FROM invocations WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::store_read("read invocation", e))
    }
}

impl crate::observer::ApplicationSource for SqliteRunStore {
    fn fetch_application(&self, app_id: &str) -> Result<Option<Value>> {
        self.get_application(app_id)
    }
}
