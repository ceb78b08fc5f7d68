//! Settings persistence and path resolution for Ankor.
//!
//! All stores live under the platform config directory
//! (`~/.config/ankor` on Linux) as small JSON files. A missing file loads
//! as defaults so a fresh installation needs no setup step.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Recurring backup frequency, expressed as the interval between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// Interval in hours, matching the tiers of the settings file.
    pub const fn hours(self) -> u32 {
        match self {
            Self::Hourly => 1,
            Self::Daily => 24,
            Self::Weekly => 168,
            Self::Monthly => 720,
        }
    }
}

/// Persisted link settings (`settings.json`).
///
/// Credentials are deliberately absent: they are used once during the
/// exchange and never written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Account username on the remote service.
    pub username: Option<String>,
    /// Computer name bound to the account namespace.
    pub computer_name: Option<String>,
    /// Base URL of the remote linking service.
    pub remote_url: Option<String>,
    /// Hostname of the backup target, as reported during the exchange.
    pub remote_host: Option<String>,
    /// Host-key fingerprint observed during the exchange. Kept here so a
    /// resumed link can re-run trust evaluation without a new exchange;
    /// the trust store only holds fingerprints the user accepted.
    pub host_fingerprint: Option<String>,
    /// Remote-assigned link token.
    pub link_token: Option<String>,
    #[serde(default)]
    pub schedule: Frequency,
    /// True once the whole link pipeline has completed.
    #[serde(default)]
    pub configured: bool,
}

impl Settings {
    /// Load settings from `path`. Returns defaults if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save settings to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Runtime configuration handed to the controller at construction.
///
/// Built once at process start; there is no ambient global state.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Directory holding every persisted store.
    pub config_dir: PathBuf,
    /// External synchronization program invoked per backup run.
    pub sync_program: String,
    /// Scope of schedule registration.
    pub schedule_scope: ScheduleScope,
    /// Directory tree handed to the sync program as the backup source.
    pub backup_source: PathBuf,
}

/// Whether the recurring schedule is installed per-user or system-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleScope {
    User,
    System,
}

impl LinkConfig {
    /// Resolve the default configuration under the platform config dir.
    pub fn resolve() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| LinkError::MissConfigured {
                message: "cannot determine the configuration directory".into(),
                source: None,
            })?
            .join("ankor");
        let backup_source = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Ok(Self {
            config_dir,
            sync_program: "rdiff-backup".into(),
            schedule_scope: ScheduleScope::User,
            backup_source,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_dir.join("state.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.config_dir.join("status.json")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.config_dir.join("known_hosts.json")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.config_dir.join("id_ankor")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config_dir.join("link.lock")
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frequency_tiers() {
        assert_eq!(Frequency::Hourly.hours(), 1);
        assert_eq!(Frequency::Daily.hours(), 24);
        assert_eq!(Frequency::Weekly.hours(), 168);
        assert_eq!(Frequency::Monthly.hours(), 720);
    }

    #[test]
    fn load_missing_settings_returns_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json")).unwrap();
        assert!(settings.username.is_none());
        assert!(!settings.configured);
        assert_eq!(settings.schedule, Frequency::Daily);
    }

    #[test]
    fn settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = Settings {
            username: Some("alice".into()),
            computer_name: Some("laptop-01".into()),
            remote_url: Some("https://backup.example.com".into()),
            remote_host: Some("backup.example.com".into()),
            host_fingerprint: Some("aa:bb:cc".into()),
            link_token: Some("tok-123".into()),
            schedule: Frequency::Weekly,
            configured: true,
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.username.as_deref(), Some("alice"));
        assert_eq!(loaded.computer_name.as_deref(), Some("laptop-01"));
        assert_eq!(loaded.schedule, Frequency::Weekly);
        assert!(loaded.configured);
    }

    #[test]
    fn corrupted_settings_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path).unwrap_err(),
            LinkError::Json(_)
        ));
    }

    #[test]
    fn config_paths_are_under_config_dir() {
        let config = LinkConfig {
            config_dir: PathBuf::from("/tmp/ankor-test"),
            sync_program: "rdiff-backup".into(),
            schedule_scope: ScheduleScope::User,
            backup_source: PathBuf::from("/home/alice"),
        };
        assert!(config.identity_path().starts_with("/tmp/ankor-test"));
        assert!(config.known_hosts_path().ends_with("known_hosts.json"));
        assert!(config.lock_path().ends_with("link.lock"));
    }
}
