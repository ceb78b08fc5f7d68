//! Known-host trust store.
//!
//! Persists the host-key fingerprints of remote servers the user has
//! explicitly accepted, so a later contact can detect impersonation. An
//! unknown host and a changed fingerprint are distinct conditions: the
//! first is expected on first use, the second may be an attack and callers
//! are expected to warn accordingly.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// A stored trust entry for a known remote host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    /// Hostname of the remote server.
    pub hostname: String,
    /// Hex colon-separated fingerprint of the host's key.
    pub fingerprint: String,
    /// When this fingerprint was first accepted (Unix timestamp).
    pub first_seen: i64,
}

/// Result of evaluating an observed host fingerprint against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustCheck {
    /// Fingerprint matches the stored record.
    Trusted,
    /// No record for this hostname — first contact.
    Unknown,
    /// A record exists with a different fingerprint. Possible
    /// impersonation, or a server key rotation the store cannot tell apart.
    Mismatched { expected: String, actual: String },
}

/// Persistent store of known host fingerprints, at most one per hostname.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrustStore {
    hosts: HashMap<String, HostRecord>,
}

/// Constant-time string equality, used for fingerprint comparison to avoid
/// timing side channels.
fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

impl TrustStore {
    /// Load the store from a JSON file. Returns default if file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| {
            CryptoError::SerializationError(format!("Failed to parse trust store: {e}"))
        })
    }

    /// Save the store to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            CryptoError::SerializationError(format!("Failed to serialize trust store: {e}"))
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Classify an observed host fingerprint.
    ///
    /// Pure over the inputs and the stored records: the same arguments
    /// against the same store always yield the same classification.
    pub fn evaluate(&self, hostname: &str, observed_fingerprint: &str) -> TrustCheck {
        match self.hosts.get(hostname) {
            None => TrustCheck::Unknown,
            Some(known) if constant_time_str_eq(&known.fingerprint, observed_fingerprint) => {
                TrustCheck::Trusted
            }
            Some(known) => TrustCheck::Mismatched {
                expected: known.fingerprint.clone(),
                actual: observed_fingerprint.to_string(),
            },
        }
    }

    /// Record acceptance of a host fingerprint.
    ///
    /// Idempotent: recording the pair already stored is a no-op. A
    /// different fingerprint for a known hostname is NOT written here —
    /// replacing a stored fingerprint requires the explicit [`retrust`]
    /// operation.
    ///
    /// [`retrust`]: Self::retrust
    pub fn record_trust(&mut self, hostname: &str, fingerprint: &str, now: i64) {
        if self.hosts.contains_key(hostname) {
            return;
        }
        self.hosts.insert(
            hostname.to_string(),
            HostRecord {
                hostname: hostname.to_string(),
                fingerprint: fingerprint.to_string(),
                first_seen: now,
            },
        );
    }

    /// Replace a stored fingerprint after the user explicitly confirmed the
    /// change. Inserts when the hostname was unknown.
    pub fn retrust(&mut self, hostname: &str, fingerprint: &str, now: i64) {
        self.hosts.insert(
            hostname.to_string(),
            HostRecord {
                hostname: hostname.to_string(),
                fingerprint: fingerprint.to_string(),
                first_seen: now,
            },
        );
    }

    /// Remove a host from the store. Returns whether a record existed.
    pub fn forget(&mut self, hostname: &str) -> bool {
        self.hosts.remove(hostname).is_some()
    }

    /// The stored record for a hostname, if any.
    pub fn get(&self, hostname: &str) -> Option<&HostRecord> {
        self.hosts.get(hostname)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
