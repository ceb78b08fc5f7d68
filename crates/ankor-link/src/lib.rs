//! Ankor linking pipeline
//!
//! Links this machine to a remote backup account:
//! identity generation, public-key exchange, host trust verification,
//! schedule registration and a validation backup, sequenced by a
//! resumable state machine.
//!
//! The OS-facing pieces (key storage, scheduler, sync tool, trust prompt)
//! sit behind narrow capability traits so the state machine is testable
//! with in-memory fakes.

pub mod controller;
pub mod keys;
pub mod negotiator;
pub mod runner;
pub mod schedule;

pub use controller::{CancelFlag, LinkController, LinkOutcome, LinkRequest, StatusReport, TrustPrompt};
pub use keys::{FileKeyManager, KeyManager, PublicKeyInfo};
pub use negotiator::{Credentials, ExchangeReply, LinkService, LinkServiceClient};
pub use runner::{BackupTarget, ExternalSyncTool, SyncTool};
pub use schedule::{ScheduleEntry, Scheduler, SystemdScheduler};
