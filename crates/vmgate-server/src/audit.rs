//! Append-only JSON-lines logs.
//!
//! Two independent streams live under the log directory:
//! - `audit.log`: one record per VM state-change attempt
//! - `app.log`: every inbound request and its authentication/outcome steps
//!
//! Write failures are reported through `tracing` and otherwise ignored; they
//! never reach the request path.
//!
//! Records are written inline on the calling task with blocking `std::fs`
//! appends. Each is one short `write_all` to an already open file, and doing it
//! in place keeps every request's records in call order, which handing writes
//! to the blocking pool would not guarantee.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const AUDIT_LOG_FILE: &str = "audit.log";
pub const APP_LOG_FILE: &str = "app.log";

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Received,
    Rejected,
    Authenticated,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub vm: String,
    pub client_ip: String,
    pub status: AuditStatus,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLogEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub status: AppStatus,
    pub details: String,
}

// ── LogSink ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    dir_ready: OnceLock<()>,
    audit: Stream,
    app: Stream,
}

struct Stream {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogSink {
    /// Nothing touches the filesystem until the first record is written.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            inner: Arc::new(Inner {
                audit: Stream::new(dir.join(AUDIT_LOG_FILE)),
                app: Stream::new(dir.join(APP_LOG_FILE)),
                dir_ready: OnceLock::new(),
                dir,
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn audit_path(&self) -> &Path {
        &self.inner.audit.path
    }

    pub fn app_path(&self) -> &Path {
        &self.inner.app.path
    }

    /// Record a VM state-change attempt.
    pub fn audit(&self, action: &str, vm: &str, client_ip: &str, status: AuditStatus, details: &str) {
        info!(vm, client_ip, ?status, details, "audit: vm.{action}");
        self.append_audit(&AuditEntry {
            timestamp: Utc::now(),
            action: action.to_owned(),
            vm: vm.to_owned(),
            client_ip: client_ip.to_owned(),
            status,
            details: details.to_owned(),
        });
    }

    /// Record one step of an inbound request.
    pub fn app(&self, method: &str, path: &str, client_ip: &str, status: AppStatus, details: &str) {
        debug!(method, path, client_ip, ?status, details, "request");
        self.append_app(&AppLogEntry {
            timestamp: Utc::now(),
            method: method.to_owned(),
            path: path.to_owned(),
            client_ip: client_ip.to_owned(),
            status,
            details: details.to_owned(),
        });
    }

    pub fn append_audit(&self, entry: &AuditEntry) {
        self.inner.write(&self.inner.audit, entry);
    }

    pub fn append_app(&self, entry: &AppLogEntry) {
        self.inner.write(&self.inner.app, entry);
    }
}

impl Inner {
    fn write<T: Serialize>(&self, stream: &Stream, record: &T) {
        let mut line = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize log record");
                return;
            }
        };
        line.push(b'\n');

        if let Err(e) = self.ensure_dir().and_then(|()| stream.append(&line)) {
            warn!(path = %stream.path.display(), error = %e, "failed to write log record");
        }
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        if self.dir_ready.get().is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let _ = self.dir_ready.set(());
        Ok(())
    }
}

impl Stream {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    /// One `write_all` per record, under the stream lock.
    fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line)?;
            file.flush()?;
        }
        Ok(())
    }
}
