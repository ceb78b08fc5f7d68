//! Backup status persistence.
//!
//! Every backup run, validation pass included, records its outcome in
//! `status.json`. The status surface reads this file to tell "never ran"
//! apart from "ran and failed".

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Classified outcome of a single backup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOutcome {
    /// The sync tool completed cleanly.
    Success,
    /// The sync tool ran but skipped some files.
    Partial,
    /// The sync tool started and failed.
    Failure,
}

/// Record of one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    /// Unix timestamp (seconds) when the run started.
    pub started_at: i64,
    /// Unix timestamp (seconds) when the run finished.
    pub completed_at: i64,
    pub outcome: BackupOutcome,
    /// Tool diagnostics for failed or partial runs.
    pub detail: Option<String>,
}

impl BackupResult {
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, BackupOutcome::Success)
    }
}

/// Current wall-clock time as a Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// On-disk backup history (`status.json`). Only the latest run and the
/// latest success are kept.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedStatus {
    last: Option<BackupResult>,
    last_success: Option<i64>,
}

/// Handle to the persisted backup status.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<PersistedStatus> {
        if !self.path.exists() {
            return Ok(PersistedStatus::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Record the outcome of a backup run.
    pub fn record(&self, result: &BackupResult) -> Result<()> {
        let mut status = self.read()?;
        if result.is_success() {
            status.last_success = Some(result.completed_at);
        }
        status.last = Some(result.clone());
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&status)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// The most recent run, or `InitialBackupHasNotRun` when no backup has
    /// ever executed. The error is an expected-absence condition.
    pub fn last_run(&self) -> Result<BackupResult> {
        self.read()?
            .last
            .ok_or(LinkError::InitialBackupHasNotRun)
    }

    /// Timestamp of the most recent successful run, if any.
    pub fn last_success(&self) -> Result<Option<i64>> {
        Ok(self.read()?.last_success)
    }

    /// Remove the status history. Idempotent.
    pub fn reset(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn result(outcome: BackupOutcome, at: i64) -> BackupResult {
        BackupResult {
            started_at: at,
            completed_at: at + 60,
            outcome,
            detail: None,
        }
    }

    #[test]
    fn never_ran_is_expected_absence() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status.json"));
        let err = status.last_run().unwrap_err();
        assert!(matches!(err, LinkError::InitialBackupHasNotRun));
        assert!(err.is_expected_absence());
    }

    #[test]
    fn record_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status.json"));

        status
            .record(&result(BackupOutcome::Success, 1000))
            .unwrap();
        let last = status.last_run().unwrap();
        assert_eq!(last.outcome, BackupOutcome::Success);
        assert_eq!(status.last_success().unwrap(), Some(1060));
    }

    #[test]
    fn failure_keeps_previous_success_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status.json"));

        status
            .record(&result(BackupOutcome::Success, 1000))
            .unwrap();
        status
            .record(&result(BackupOutcome::Failure, 2000))
            .unwrap();

        assert_eq!(status.last_run().unwrap().outcome, BackupOutcome::Failure);
        assert_eq!(status.last_success().unwrap(), Some(1060));
    }

    #[test]
    fn partial_is_not_a_success() {
        let r = result(BackupOutcome::Partial, 1000);
        assert!(!r.is_success());
    }

    #[test]
    fn reset_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status.json"));
        status
            .record(&result(BackupOutcome::Success, 1000))
            .unwrap();
        status.reset().unwrap();
        status.reset().unwrap();
        assert!(matches!(
            status.last_run().unwrap_err(),
            LinkError::InitialBackupHasNotRun
        ));
    }
}
