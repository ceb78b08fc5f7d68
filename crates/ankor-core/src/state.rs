//! Persisted link-phase state.
//!
//! Each completed phase of the link pipeline is written to disk before the
//! next one starts, so a crash or cancellation mid-link resumes at the
//! first incomplete phase instead of repeating completed side effects.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Phase of the link lifecycle, in pipeline order.
///
/// The derived ordering is load-bearing: the controller compares states to
/// decide which phases are already done.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unconfigured,
    KeyGenerated,
    KeyExchanged,
    TrustVerified,
    ScheduleRegistered,
    Linked,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::KeyGenerated => "key generated",
            Self::KeyExchanged => "key exchanged",
            Self::TrustVerified => "trust verified",
            Self::ScheduleRegistered => "schedule registered",
            Self::Linked => "linked",
        };
        f.write_str(s)
    }
}

/// On-disk record of the current link phase (`state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedState {
    state: LinkState,
}

/// Handle to the persisted link state.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the current phase. A missing file means `Unconfigured`.
    pub fn load(&self) -> Result<LinkState> {
        if !self.path.exists() {
            return Ok(LinkState::Unconfigured);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let persisted: PersistedState = serde_json::from_str(&data)?;
        Ok(persisted.state)
    }

    /// Persist a phase transition.
    pub fn store(&self, state: LinkState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&PersistedState { state })?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Reset to `Unconfigured` by removing the file. Idempotent.
    pub fn reset(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
