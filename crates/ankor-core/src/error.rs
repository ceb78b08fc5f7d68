//! Error types for the Ankor linking core.
//!
//! The taxonomy is a flat tagged enum: callers dispatch on the variant
//! rather than on an exception subtype. Every infrastructure variant carries
//! its underlying cause so diagnostics are never lost.

use thiserror::Error;

/// Result type alias using Ankor's [`LinkError`].
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors produced by the linking pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The requested computer name is already registered on the remote
    /// account. User-correctable: retry with another name, the generated
    /// identity is kept.
    #[error("computer name {name:?} already in use")]
    ComputerNameAlreadyInUse { name: String },

    /// The remote service rejected the supplied credentials.
    #[error("authentication with the remote service failed")]
    AuthenticationFailed,

    /// Failed to send the public key to the remote service (transport or
    /// protocol failure, not a name collision).
    #[error("failed to exchange the public key with the remote service")]
    ExchangeKey {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Keypair generation or secure storage of the key failed.
    #[error("failed to generate the security keys")]
    GenerateKey {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The remote host presented a key the user declined to trust.
    #[error("remote host {hostname} is not trusted (fingerprint {fingerprint})")]
    UntrustedHostKey {
        hostname: String,
        fingerprint: String,
    },

    /// The application is configured in a way that prevents the operation
    /// (wrong principal, concurrent link attempt, broken scheduler state).
    #[error("misconfigured: {message}")]
    MissConfigured {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The application has not been configured yet. A valid query result,
    /// not a failure: it means "not yet linked".
    #[error("not configured: {message}")]
    NotConfigured { message: String },

    /// The current process lacks the privileges for the operation, detected
    /// before any native call was attempted.
    #[error("insufficient permissions to execute this operation")]
    InsufficientPermissions,

    /// The host operating system has no supported scheduler backend.
    #[error("unsupported operating system: {os}")]
    UnsupportedOs { os: String },

    /// The external synchronization binary is not installed.
    #[error("sync tool {program:?} is missing")]
    SyncToolMissing { program: String },

    /// No schedule is registered for this installation. Expected while not
    /// yet linked.
    #[error("scheduled task not found")]
    ScheduleNotFound,

    /// The validation backup ran but did not complete successfully. The
    /// link itself is retained.
    #[error("initial backup did not complete successfully")]
    InitialBackupFailed {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Status was queried before any backup has run. Expected right after
    /// linking, before the validation pass.
    #[error("initial backup has not run yet")]
    InitialBackupHasNotRun,

    /// Controller-level wrapper: the link operation failed. The original
    /// cause is preserved for diagnostics.
    #[error("failed to link computer")]
    LinkComputer {
        #[source]
        source: Box<LinkError>,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Wrap any failure in the controller-level link error, preserving the
    /// cause. Already-wrapped errors are returned unchanged.
    pub fn into_link_failure(self) -> Self {
        match self {
            Self::LinkComputer { .. } => self,
            other => Self::LinkComputer {
                source: Box::new(other),
            },
        }
    }

    /// True for "not yet configured" query results that calling code must
    /// treat as valid states rather than failures.
    pub const fn is_expected_absence(&self) -> bool {
        matches!(
            self,
            Self::ScheduleNotFound | Self::InitialBackupHasNotRun | Self::NotConfigured { .. }
        )
    }

    /// True when the error is correctable by the user re-entering input
    /// (new name, new credentials) without discarding pipeline progress.
    pub const fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::ComputerNameAlreadyInUse { .. } | Self::AuthenticationFailed
        )
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn io_err() -> std::io::Error {
        std::io::Error::other("boom")
    }

    #[test]
    fn link_failure_wraps_once() {
        let err = LinkError::ExchangeKey {
            source: Box::new(io_err()),
        };
        let wrapped = err.into_link_failure();
        assert!(matches!(wrapped, LinkError::LinkComputer { .. }));
        let rewrapped = wrapped.into_link_failure();
        // Wrapping a second time must not nest another layer.
        match rewrapped {
            LinkError::LinkComputer { source } => {
                assert!(matches!(*source, LinkError::ExchangeKey { .. }));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn cause_is_preserved_through_wrapping() {
        use std::error::Error;
        let err = LinkError::GenerateKey {
            source: Box::new(io_err()),
        }
        .into_link_failure();
        let cause = err.source().and_then(|e| e.source());
        assert!(cause.is_some(), "original cause must stay reachable");
    }

    #[test]
    fn expected_absence_classification() {
        assert!(LinkError::ScheduleNotFound.is_expected_absence());
        assert!(LinkError::InitialBackupHasNotRun.is_expected_absence());
        assert!(
            LinkError::NotConfigured {
                message: "no identity".into()
            }
            .is_expected_absence()
        );
        assert!(!LinkError::InsufficientPermissions.is_expected_absence());
        assert!(
            !LinkError::InitialBackupFailed {
                source: Box::new(io_err())
            }
            .is_expected_absence()
        );
    }

    #[test]
    fn user_correctable_classification() {
        assert!(
            LinkError::ComputerNameAlreadyInUse {
                name: "laptop-01".into()
            }
            .is_user_correctable()
        );
        assert!(LinkError::AuthenticationFailed.is_user_correctable());
        assert!(!LinkError::ScheduleNotFound.is_user_correctable());
    }
}
