//! Append-only, durable audit log.
//!
//! Every privileged action attempt ends up here, committed before the
//! caller learns the outcome. The on-disk format is JSON lines, one record
//! per line, insertion-ordered and human-auditable.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

const DEFAULT_MAX_RECORDS: usize = 1000;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("audit task aborted")]
    Aborted,
}

/// A privileged action attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Disable,
    Enable,
    ResetCredential,
    Search,
    /// Internal: the persisted store was unreadable at startup and the log
    /// restarted empty.
    LogRecovered,
}

impl AuditAction {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Enable => "enable",
            Self::ResetCredential => "reset_credential",
            Self::Search => "search",
            Self::LogRecovered => "log_recovered",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure { reason: String },
}

/// One immutable audit entry. Once written, never rewritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub outcome: AuditOutcome,
    pub source_address: String,
}

impl AuditRecord {
    /// Create a record stamped now.
    pub fn new(
        actor: impl Into<String>,
        action: AuditAction,
        target: impl Into<String>,
        outcome: AuditOutcome,
        source_address: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action,
            target: target.into(),
            outcome,
            source_address: source_address.into(),
        }
    }
}

/// Storage capability for audit records, so the backend (file, embedded
/// store, external service) is swappable without touching gateway logic.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a record. Returns only once it is durably persisted.
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// Most recent records first.
    async fn list(&self, limit: usize) -> Result<Vec<AuditRecord>, AuditError>;
}

struct LogInner {
    records: VecDeque<AuditRecord>,
    /// A recovery record must be written on the next successful append.
    recovery_pending: bool,
}

/// File-backed [`AuditStore`]. The append path is the single serialization
/// point: records are strictly ordered by commit time.
pub struct FileAuditLog {
    path: PathBuf,
    max_records: usize,
    inner: Mutex<LogInner>,
}

impl FileAuditLog {
    /// Open or create the log at `path`.
    ///
    /// An unreadable or malformed store does not fail startup: the log
    /// restarts empty and the event itself is recorded on the next append.
    pub fn open(path: impl Into<PathBuf>, max_records: Option<usize>) -> Self {
        let path = path.into();
        let max_records = max_records.unwrap_or(DEFAULT_MAX_RECORDS);

        let (records, recovery_pending) = match read_records(&path) {
            Ok(records) => (records, false),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "audit store unreadable, starting empty"
                );
                (VecDeque::new(), true)
            },
        };

        Self {
            path,
            max_records,
            inner: Mutex::new(LogInner {
                records,
                recovery_pending,
            }),
        }
    }

    async fn commit(
        &self,
        inner: &mut LogInner,
        record: AuditRecord,
    ) -> Result<(), AuditError> {
        let line = serde_json::to_string(&record)?;
        let overflow =
            (inner.records.len() + 1).saturating_sub(self.max_records);

        if overflow > 0 {
            // Rotation drops oldest first, never reorders.
            let mut contents = String::new();
            for kept in inner.records.iter().skip(overflow) {
                contents.push_str(&serde_json::to_string(kept)?);
                contents.push('\n');
            }
            contents.push_str(&line);
            contents.push('\n');

            let path = self.path.clone();
            tokio::task::spawn_blocking(move || rewrite(&path, &contents))
                .await
                .map_err(|_| AuditError::Aborted)??;
        } else {
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || append_line(&path, &line))
                .await
                .map_err(|_| AuditError::Aborted)??;
        }

        // Memory follows disk, never the other way round: an uncommitted
        // record must not become listable.
        inner.records.push_back(record);
        for _ in 0..overflow {
            inner.records.pop_front();
        }

        metrics::counter!("audit_records_total").increment(1);
        Ok(())
    }
}

#[async_trait]
impl AuditStore for FileAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut inner = self.inner.lock().await;

        if inner.recovery_pending {
            // Drop the unreadable contents so the store parses again.
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || rewrite(&path, ""))
                .await
                .map_err(|_| AuditError::Aborted)??;

            let recovery = AuditRecord::new(
                "dirgate",
                AuditAction::LogRecovered,
                "-",
                AuditOutcome::Success,
                "local",
            );
            self.commit(&mut inner, recovery).await?;
            inner.recovery_pending = false;
        }

        self.commit(&mut inner, record).await
    }

    async fn list(
        &self,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().rev().take(limit).cloned().collect())
    }
}

fn read_records(path: &Path) -> Result<VecDeque<AuditRecord>, AuditError> {
    if !path.exists() {
        return Ok(VecDeque::new());
    }

    let file = File::open(path)?;
    let mut records = VecDeque::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push_back(serde_json::from_str(&line)?);
    }

    Ok(records)
}

/// Append one line and block until it reaches durable storage.
fn append_line(path: &Path, line: &str) -> Result<(), AuditError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

/// Replace the whole store, via a temporary file and an atomic rename.
fn rewrite(path: &Path, contents: &str) -> Result<(), AuditError> {
    let tmp = path.with_extension("tmp");

    let mut file = File::create(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory stores used by gateway and router tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryAudit {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl MemoryAudit {
        pub fn records(&self) -> Vec<AuditRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditStore for MemoryAudit {
        async fn append(
            &self,
            record: AuditRecord,
        ) -> Result<(), AuditError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        async fn list(
            &self,
            limit: usize,
        ) -> Result<Vec<AuditRecord>, AuditError> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().rev().take(limit).cloned().collect())
        }
    }

    /// Simulates a write error on every append.
    #[derive(Default)]
    pub struct FailingAudit;

    #[async_trait]
    impl AuditStore for FailingAudit {
        async fn append(
            &self,
            _record: AuditRecord,
        ) -> Result<(), AuditError> {
            Err(AuditError::Io(std::io::Error::other("disk full")))
        }

        async fn list(
            &self,
            _limit: usize,
        ) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(vec![])
        }
    }
}
