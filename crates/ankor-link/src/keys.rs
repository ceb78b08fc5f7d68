//! Key management capability.
//!
//! Wraps the identity keypair storage behind a narrow trait so the
//! controller never touches key files directly.

use std::path::PathBuf;

use ankor_core::error::{LinkError, Result};
use ankor_crypto::{CryptoError, IdentityKeyPair};

/// Exportable view of the local identity: everything the remote service
/// and the trust surface need, and nothing secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    /// Public key export line (`ankor-ed25519 <hex> <comment>`).
    pub export_line: String,
    /// Colon-hex SHA-256 fingerprint of the public key.
    pub fingerprint: String,
}

/// Capability interface over identity generation and storage.
pub trait KeyManager {
    /// Create a new keypair, replacing any existing one. Regeneration
    /// invalidates the previously exchanged key on the remote side, so
    /// callers must re-run the exchange afterwards.
    fn generate_identity(&self, comment: &str) -> Result<PublicKeyInfo>;

    /// The exportable public key, or `NotConfigured` when no identity
    /// exists yet.
    fn current_public_key(&self) -> Result<PublicKeyInfo>;

    /// Delete the stored identity. Idempotent.
    fn remove_identity(&self) -> Result<()>;
}

/// Key manager over a single secret-key file (0600) in the config dir.
#[derive(Debug, Clone)]
pub struct FileKeyManager {
    path: PathBuf,
}

impl FileKeyManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn info(keypair: &IdentityKeyPair, comment: &str) -> PublicKeyInfo {
        PublicKeyInfo {
            export_line: keypair.export_public(comment),
            fingerprint: keypair.fingerprint(),
        }
    }

    fn comment_path(&self) -> PathBuf {
        self.path.with_extension("comment")
    }
}

impl KeyManager for FileKeyManager {
    fn generate_identity(&self, comment: &str) -> Result<PublicKeyInfo> {
        let keypair = IdentityKeyPair::generate();
        keypair
            .save_to_file(&self.path)
            .map_err(|e| LinkError::GenerateKey {
                source: Box::new(e),
            })?;
        // The comment is public metadata; stored beside the key so the
        // export line survives a reload.
        std::fs::write(self.comment_path(), comment).map_err(|e| LinkError::GenerateKey {
            source: Box::new(e),
        })?;
        tracing::info!(fingerprint = %keypair.fingerprint(), "generated new identity keypair");
        Ok(Self::info(&keypair, comment))
    }

    fn current_public_key(&self) -> Result<PublicKeyInfo> {
        let keypair = match IdentityKeyPair::load_from_file(&self.path) {
            Ok(kp) => kp,
            Err(CryptoError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LinkError::NotConfigured {
                    message: "no identity keypair has been generated".into(),
                });
            }
            Err(e) => {
                return Err(LinkError::MissConfigured {
                    message: "identity key file is unreadable".into(),
                    source: Some(Box::new(e)),
                });
            }
        };
        let comment = std::fs::read_to_string(self.comment_path()).unwrap_or_default();
        Ok(Self::info(&keypair, comment.trim()))
    }

    fn remove_identity(&self) -> Result<()> {
        for path in [self.path.clone(), self.comment_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
