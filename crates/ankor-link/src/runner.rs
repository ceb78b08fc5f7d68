//! Backup runner: one pass of the external synchronization tool.
//!
//! The transfer itself belongs to the external tool; this module only
//! invokes it, captures the outcome and classifies it. "Never started"
//! (binary missing) is a different condition from "started and failed",
//! and neither triggers a retry here — retry is controller policy.

use std::path::PathBuf;
use std::process::Command;

use ankor_core::error::{LinkError, Result};
use ankor_core::status::{unix_now, BackupOutcome, BackupResult};

/// Where a backup run sends its data, derived from the persisted settings.
#[derive(Debug, Clone)]
pub struct BackupTarget {
    pub username: String,
    pub remote_host: String,
    pub computer_name: String,
}

impl BackupTarget {
    /// Destination in the tool's `user@host::repository` notation.
    pub fn destination(&self) -> String {
        format!(
            "{}@{}::{}",
            self.username, self.remote_host, self.computer_name
        )
    }
}

/// Capability interface over the external synchronization tool.
pub trait SyncTool {
    /// Run one backup pass synchronously.
    ///
    /// Returns a classified [`BackupResult`] when the tool started, even if
    /// it then failed. Returns `SyncToolMissing` when the binary is not
    /// installed — the tool never started at all.
    fn run_once(&self, target: &BackupTarget) -> Result<BackupResult>;
}

/// Runner over the configured sync binary.
#[derive(Debug, Clone)]
pub struct ExternalSyncTool {
    program: String,
    /// Directory tree handed to the tool as the backup source.
    source: PathBuf,
}

impl ExternalSyncTool {
    pub fn new(program: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            source: source.into(),
        }
    }

    /// Map the tool's exit code to an outcome. Codes 23/24 are the
    /// rsync-family convention for "ran, but some files were skipped".
    const fn classify(code: i32) -> BackupOutcome {
        match code {
            0 => BackupOutcome::Success,
            23 | 24 => BackupOutcome::Partial,
            _ => BackupOutcome::Failure,
        }
    }
}

impl SyncTool for ExternalSyncTool {
    fn run_once(&self, target: &BackupTarget) -> Result<BackupResult> {
        let destination = target.destination();
        let started_at = unix_now();
        tracing::info!(program = %self.program, %destination, "starting backup run");

        let output = match Command::new(&self.program)
            .arg(&self.source)
            .arg(&destination)
            .output()
        {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LinkError::SyncToolMissing {
                    program: self.program.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let completed_at = unix_now();
        let code = output.status.code().unwrap_or(-1);
        let outcome = Self::classify(code);
        let detail = if outcome == BackupOutcome::Success {
            None
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Some(format!("exit {code}: {}", stderr.trim()))
        };
        tracing::info!(?outcome, code, "backup run finished");

        Ok(BackupResult {
            started_at,
            completed_at,
            outcome,
            detail,
        })
    }
}
