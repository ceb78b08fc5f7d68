//! Ankor Core Library
//!
//! Shared functionality for Ankor components:
//! - Settings and link-state persistence
//! - Backup status records
//! - Domain error taxonomy
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod state;
pub mod status;
pub mod tracing_init;

pub use config::{Frequency, LinkConfig, ScheduleScope, Settings};
pub use error::{LinkError, Result};
pub use state::{LinkState, StateFile};
pub use status::{BackupOutcome, BackupResult, StatusFile};
