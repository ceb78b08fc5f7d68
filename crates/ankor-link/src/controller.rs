//! The link controller: a resumable five-phase state machine.
//!
//! Phases run strictly in order, each one persisting its completion before
//! the next starts:
//!
//! 1. generate identity
//! 2. exchange the public key with the remote service
//! 3. verify trust in the observed host key
//! 4. register the recurring schedule
//! 5. run the validation backup
//!
//! A failed or cancelled attempt leaves the highest completed phase on
//! disk; the next invocation re-enters exactly there, never repeating a
//! completed phase's side effects. Cancellation is honored only at phase
//! boundaries so no native call is abandoned mid-flight.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ankor_core::config::{Frequency, LinkConfig, Settings};
use ankor_core::error::{LinkError, Result};
use ankor_core::state::{LinkState, StateFile};
use ankor_core::status::{unix_now, BackupResult, StatusFile};
use ankor_crypto::{TrustCheck, TrustStore};

use crate::keys::KeyManager;
use crate::negotiator::{Credentials, LinkService};
use crate::runner::{BackupTarget, SyncTool};
use crate::schedule::{ScheduleEntry, Scheduler};

/// Shared cancellation flag, checked between phases.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Capability interface for the explicit trust decision.
///
/// `Unknown` and `Mismatched` both land here; implementations are expected
/// to warn much louder on `Mismatched` (possible impersonation) than on
/// `Unknown` (normal on first use). Returning `false` aborts the link.
pub trait TrustPrompt {
    fn confirm_trust(&self, hostname: &str, fingerprint: &str, check: &TrustCheck) -> bool;
}

/// Input to a link attempt.
#[derive(Debug)]
pub struct LinkRequest {
    pub computer_name: String,
    pub remote_url: String,
    pub credentials: Credentials,
    pub frequency: Frequency,
}

/// How a link attempt ended short of an error.
#[derive(Debug)]
pub enum LinkOutcome {
    /// Fully linked, validation backup succeeded.
    Linked,
    /// Linked, but the validation backup did not complete successfully.
    /// The link is retained; the backup can be retried on its own.
    LinkedWithWarning(LinkError),
    /// Cancelled at a phase boundary; completed phases are preserved and a
    /// later attempt resumes from the reported state.
    Cancelled(LinkState),
}

/// Snapshot returned by [`LinkController::status`].
#[derive(Debug)]
pub struct StatusReport {
    pub state: LinkState,
    pub settings: Settings,
    /// The installed recurring trigger; `None` means no schedule is
    /// registered for this installation.
    pub schedule: Option<ScheduleEntry>,
    /// Most recent backup run; `None` means no backup has ever run.
    pub last_backup: Option<BackupResult>,
}

fn concurrent_operation_error() -> LinkError {
    LinkError::MissConfigured {
        message: "another link or unlink operation is already running".into(),
        source: None,
    }
}

/// Exclusive lock over the persisted stores: only one link/unlink
/// operation may run at a time per installation. The lock is an advisory
/// `flock`, so it dies with the process: a crashed attempt leaves a stale
/// lock file behind but never blocks the next one.
#[cfg(unix)]
struct LockGuard {
    _lock: nix::fcntl::Flock<std::fs::File>,
}

#[cfg(unix)]
impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        match nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { _lock: lock }),
            Err(_) => Err(concurrent_operation_error()),
        }
    }
}

#[cfg(not(unix))]
struct LockGuard {
    path: std::path::PathBuf,
}

#[cfg(not(unix))]
impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => Ok(Self {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(concurrent_operation_error())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(unix))]
impl Drop for LockGuard {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

/// Sequences the linking pipeline over its capability interfaces.
///
/// Construction takes an explicit [`LinkConfig`]; the controller holds no
/// ambient global state.
pub struct LinkController<K, N, S, B, P> {
    config: LinkConfig,
    keys: K,
    service: N,
    scheduler: S,
    sync: B,
    prompt: P,
}

impl<K, N, S, B, P> LinkController<K, N, S, B, P>
where
    K: KeyManager,
    N: LinkService,
    S: Scheduler,
    B: SyncTool,
    P: TrustPrompt,
{
    pub const fn new(
        config: LinkConfig,
        keys: K,
        service: N,
        scheduler: S,
        sync: B,
        prompt: P,
    ) -> Self {
        Self {
            config,
            keys,
            service,
            scheduler,
            sync,
            prompt,
        }
    }

    fn state_file(&self) -> StateFile {
        StateFile::new(self.config.state_path())
    }

    fn status_file(&self) -> StatusFile {
        StatusFile::new(self.config.status_path())
    }

    fn load_settings(&self) -> Result<Settings> {
        Settings::load(&self.config.settings_path())
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        settings.save(&self.config.settings_path())
    }

    /// Run the link pipeline, resuming from the highest completed phase.
    pub fn start_link(&self, request: &LinkRequest, cancel: &CancelFlag) -> Result<LinkOutcome> {
        let _lock = LockGuard::acquire(&self.config.lock_path())?;
        let state_file = self.state_file();
        let mut state = state_file.load()?;
        tracing::info!(%state, computer_name = %request.computer_name, "link operation started");

        if state < LinkState::KeyGenerated {
            self.phase_generate_key(request)?;
            state = LinkState::KeyGenerated;
            state_file.store(state)?;
        }
        if cancel.is_cancelled() {
            return Ok(LinkOutcome::Cancelled(state));
        }

        if state < LinkState::KeyExchanged {
            self.phase_exchange_key(request)?;
            state = LinkState::KeyExchanged;
            state_file.store(state)?;
        }
        if cancel.is_cancelled() {
            return Ok(LinkOutcome::Cancelled(state));
        }

        if state < LinkState::TrustVerified {
            self.phase_verify_trust()?;
            state = LinkState::TrustVerified;
            state_file.store(state)?;
        }
        if cancel.is_cancelled() {
            return Ok(LinkOutcome::Cancelled(state));
        }

        if state < LinkState::ScheduleRegistered {
            self.phase_register_schedule()?;
            state = LinkState::ScheduleRegistered;
            state_file.store(state)?;
        }
        if cancel.is_cancelled() {
            return Ok(LinkOutcome::Cancelled(state));
        }

        // Phase 5: validation backup. A run that started but failed does
        // not unlink the machine; the link is established either way.
        let result = self.run_backup()?;
        state_file.store(LinkState::Linked)?;
        let mut settings = self.load_settings()?;
        settings.configured = true;
        self.save_settings(&settings)?;

        if result.is_success() {
            tracing::info!("link completed, validation backup succeeded");
            Ok(LinkOutcome::Linked)
        } else {
            let detail = result.detail.unwrap_or_else(|| "unknown failure".into());
            tracing::warn!(%detail, "linked, but the validation backup failed");
            Ok(LinkOutcome::LinkedWithWarning(
                LinkError::InitialBackupFailed {
                    source: Box::new(std::io::Error::other(detail)),
                },
            ))
        }
    }

    /// Phase 1. Nothing is persisted when generation fails, so a failed
    /// attempt leaves the machine exactly unconfigured.
    fn phase_generate_key(&self, request: &LinkRequest) -> Result<()> {
        let comment = format!(
            "{}@{}",
            request.credentials.username, request.computer_name
        );
        self.keys.generate_identity(&comment)?;
        Ok(())
    }

    /// Phase 2. A name collision or bad credentials goes back to the
    /// caller untouched, keeping the generated identity; anything else is
    /// wrapped as a link failure with the cause attached.
    fn phase_exchange_key(&self, request: &LinkRequest) -> Result<()> {
        let key = self.keys.current_public_key()?;
        let reply = self
            .service
            .exchange_key(&key.export_line, &request.computer_name, &request.credentials)
            .map_err(|e| {
                if e.is_user_correctable() {
                    e
                } else {
                    e.into_link_failure()
                }
            })?;

        let mut settings = self.load_settings()?;
        settings.username = Some(request.credentials.username.clone());
        settings.computer_name = Some(request.computer_name.clone());
        settings.remote_url = Some(request.remote_url.clone());
        settings.remote_host = Some(reply.remote_host);
        settings.host_fingerprint = Some(reply.host_fingerprint);
        settings.link_token = Some(reply.token);
        settings.schedule = request.frequency;
        self.save_settings(&settings)
    }

    /// Phase 3. `Trusted` proceeds automatically; `Unknown` and
    /// `Mismatched` require the explicit decision, and declining aborts
    /// with `UntrustedHostKey` before any schedule exists.
    fn phase_verify_trust(&self) -> Result<()> {
        let settings = self.load_settings()?;
        let (hostname, fingerprint) = match (&settings.remote_host, &settings.host_fingerprint) {
            (Some(h), Some(f)) => (h.clone(), f.clone()),
            _ => {
                return Err(LinkError::MissConfigured {
                    message: "key exchange is recorded but the host identity is missing".into(),
                    source: None,
                });
            }
        };

        let path = self.config.known_hosts_path();
        let mut store = TrustStore::load(&path).map_err(|e| LinkError::MissConfigured {
            message: "trust store is unreadable".into(),
            source: Some(Box::new(e)),
        })?;

        let check = store.evaluate(&hostname, &fingerprint);
        match &check {
            TrustCheck::Trusted => return Ok(()),
            TrustCheck::Unknown => {
                tracing::info!(%hostname, "first contact with remote host");
            }
            TrustCheck::Mismatched { expected, .. } => {
                tracing::warn!(
                    %hostname,
                    %expected,
                    observed = %fingerprint,
                    "host key fingerprint changed since it was last trusted"
                );
            }
        }

        if !self.prompt.confirm_trust(&hostname, &fingerprint, &check) {
            return Err(LinkError::UntrustedHostKey {
                hostname,
                fingerprint,
            });
        }
        match check {
            TrustCheck::Unknown => store.record_trust(&hostname, &fingerprint, unix_now()),
            TrustCheck::Mismatched { .. } => store.retrust(&hostname, &fingerprint, unix_now()),
            TrustCheck::Trusted => {}
        }
        store.save(&path).map_err(|e| LinkError::MissConfigured {
            message: "failed to persist the trust store".into(),
            source: Some(Box::new(e)),
        })
    }

    /// Phase 4. On failure the state stays `TrustVerified`: the exchanged
    /// key and the trust record are cheap to keep and scheduling alone can
    /// be retried.
    fn phase_register_schedule(&self) -> Result<()> {
        let settings = self.load_settings()?;
        let entry = ScheduleEntry {
            frequency: settings.schedule,
            command: backup_command(),
            enabled: true,
        };
        self.scheduler.register_schedule(&entry)
    }

    fn backup_target(&self, settings: &Settings) -> Result<BackupTarget> {
        match (
            &settings.username,
            &settings.remote_host,
            &settings.computer_name,
        ) {
            (Some(username), Some(remote_host), Some(computer_name)) => Ok(BackupTarget {
                username: username.clone(),
                remote_host: remote_host.clone(),
                computer_name: computer_name.clone(),
            }),
            _ => Err(LinkError::NotConfigured {
                message: "this machine is not linked to a backup account".into(),
            }),
        }
    }

    /// Run one backup pass and record its outcome. Used both for the
    /// link-time validation run and for manual retries afterwards.
    pub fn run_backup(&self) -> Result<BackupResult> {
        let settings = self.load_settings()?;
        let target = self.backup_target(&settings)?;
        let result = self.sync.run_once(&target)?;
        self.status_file().record(&result)?;
        Ok(result)
    }

    /// Current link phase, settings and last backup run.
    ///
    /// A machine that never ran a backup reports `last_backup: None`,
    /// which for a `Linked` machine means the initial backup has not run —
    /// a valid state, distinct from a failed run.
    pub fn status(&self) -> Result<StatusReport> {
        let state = self.state_file().load()?;
        let settings = self.load_settings()?;
        // Status must stay answerable even where no scheduler backend
        // exists, so an unsupported OS reads as "no schedule".
        let schedule = match self.scheduler.find_schedule() {
            Ok(entry) => Some(entry),
            Err(e) if e.is_expected_absence() => None,
            Err(LinkError::UnsupportedOs { .. }) => None,
            Err(e) => return Err(e),
        };
        let last_backup = match self.status_file().last_run() {
            Ok(result) => Some(result),
            Err(LinkError::InitialBackupHasNotRun) => None,
            Err(e) => return Err(e),
        };
        Ok(StatusReport {
            state,
            settings,
            schedule,
            last_backup,
        })
    }

    /// Remove the link: schedule, link token (best effort), identity and
    /// local state. Trust records are kept — they describe the server, not
    /// this link. Safe to call when nothing is linked.
    pub fn unlink(&self) -> Result<()> {
        let _lock = LockGuard::acquire(&self.config.lock_path())?;
        tracing::info!("unlinking from the backup account");

        self.scheduler.remove_schedule()?;

        let settings = self.load_settings()?;
        if let Some(token) = &settings.link_token {
            if let Err(e) = self.service.revoke(token) {
                tracing::warn!(error = %e, "failed to revoke the link token remotely");
            }
        }

        self.keys.remove_identity()?;
        match std::fs::remove_file(self.config.settings_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.status_file().reset()?;
        self.state_file().reset()?;
        Ok(())
    }
}

/// Command the OS scheduler runs per trigger: this binary's `backup`
/// subcommand.
fn backup_command() -> String {
    std::env::current_exe().map_or_else(
        |_| "ankor backup".into(),
        |exe| format!("{} backup", exe.display()),
    )
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    use ankor_core::config::ScheduleScope;
    use ankor_core::status::BackupOutcome;

    use crate::keys::PublicKeyInfo;
    use crate::negotiator::ExchangeReply;

    // ----- in-memory fakes over the capability traits -----

    #[derive(Default)]
    struct KeysState {
        key: Option<PublicKeyInfo>,
        generate_calls: usize,
        fail_generate: bool,
    }

    #[derive(Clone, Default)]
    struct MemoryKeys {
        inner: Rc<RefCell<KeysState>>,
    }

    impl KeyManager for MemoryKeys {
        fn generate_identity(&self, comment: &str) -> Result<PublicKeyInfo> {
            let mut state = self.inner.borrow_mut();
            if state.fail_generate {
                return Err(LinkError::GenerateKey {
                    source: Box::new(std::io::Error::other("entropy source unavailable")),
                });
            }
            state.generate_calls += 1;
            let info = PublicKeyInfo {
                export_line: format!("ankor-ed25519 deadbeef{:02} {comment}", state.generate_calls),
                fingerprint: format!("fp:{:02}", state.generate_calls),
            };
            state.key = Some(info.clone());
            Ok(info)
        }

        fn current_public_key(&self) -> Result<PublicKeyInfo> {
            self.inner
                .borrow()
                .key
                .clone()
                .ok_or(LinkError::NotConfigured {
                    message: "no identity".into(),
                })
        }

        fn remove_identity(&self) -> Result<()> {
            self.inner.borrow_mut().key = None;
            Ok(())
        }
    }

    #[derive(Default)]
    struct ServiceState {
        taken_names: HashSet<String>,
        fail_transport: bool,
        exchange_calls: usize,
        revoked: Vec<String>,
    }

    #[derive(Clone)]
    struct FakeService {
        inner: Rc<RefCell<ServiceState>>,
        host_fingerprint: String,
    }

    impl FakeService {
        fn new(host_fingerprint: &str) -> Self {
            Self {
                inner: Rc::default(),
                host_fingerprint: host_fingerprint.into(),
            }
        }
    }

    impl LinkService for FakeService {
        fn exchange_key(
            &self,
            _public_key: &str,
            computer_name: &str,
            _credentials: &Credentials,
        ) -> Result<ExchangeReply> {
            let mut state = self.inner.borrow_mut();
            state.exchange_calls += 1;
            if state.fail_transport {
                return Err(LinkError::ExchangeKey {
                    source: Box::new(std::io::Error::other("connection reset")),
                });
            }
            if state.taken_names.contains(computer_name) {
                return Err(LinkError::ComputerNameAlreadyInUse {
                    name: computer_name.to_string(),
                });
            }
            Ok(ExchangeReply {
                token: format!("tok-{computer_name}"),
                remote_host: "backup.example.com".into(),
                host_fingerprint: self.host_fingerprint.clone(),
            })
        }

        fn revoke(&self, token: &str) -> Result<()> {
            self.inner.borrow_mut().revoked.push(token.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct SchedulerState {
        registered: Option<ScheduleEntry>,
        register_calls: usize,
        fail_permission: bool,
    }

    #[derive(Clone, Default)]
    struct FakeScheduler {
        inner: Rc<RefCell<SchedulerState>>,
    }

    impl Scheduler for FakeScheduler {
        fn register_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
            let mut state = self.inner.borrow_mut();
            state.register_calls += 1;
            if state.fail_permission {
                return Err(LinkError::InsufficientPermissions);
            }
            state.registered = Some(entry.clone());
            Ok(())
        }

        fn find_schedule(&self) -> Result<ScheduleEntry> {
            self.inner
                .borrow()
                .registered
                .clone()
                .ok_or(LinkError::ScheduleNotFound)
        }

        fn remove_schedule(&self) -> Result<()> {
            self.inner.borrow_mut().registered = None;
            Ok(())
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum SyncMode {
        Success,
        Failure,
        Missing,
    }

    struct SyncState {
        mode: SyncMode,
        run_calls: usize,
    }

    #[derive(Clone)]
    struct FakeSync {
        inner: Rc<RefCell<SyncState>>,
    }

    impl FakeSync {
        fn new(mode: SyncMode) -> Self {
            Self {
                inner: Rc::new(RefCell::new(SyncState { mode, run_calls: 0 })),
            }
        }
    }

    impl SyncTool for FakeSync {
        fn run_once(&self, _target: &BackupTarget) -> Result<BackupResult> {
            let mut state = self.inner.borrow_mut();
            state.run_calls += 1;
            match state.mode {
                SyncMode::Missing => Err(LinkError::SyncToolMissing {
                    program: "rdiff-backup".into(),
                }),
                mode => Ok(BackupResult {
                    started_at: 1000,
                    completed_at: 1060,
                    outcome: if mode == SyncMode::Success {
                        BackupOutcome::Success
                    } else {
                        BackupOutcome::Failure
                    },
                    detail: (mode == SyncMode::Failure).then(|| "exit 12: quota exceeded".into()),
                }),
            }
        }
    }

    #[derive(Default)]
    struct PromptState {
        accept: bool,
        cancel_on_prompt: Option<CancelFlag>,
        seen: Vec<TrustCheck>,
    }

    #[derive(Clone, Default)]
    struct FakePrompt {
        inner: Rc<RefCell<PromptState>>,
    }

    impl FakePrompt {
        fn accepting() -> Self {
            let prompt = Self::default();
            prompt.inner.borrow_mut().accept = true;
            prompt
        }

        fn declining() -> Self {
            Self::default()
        }
    }

    impl TrustPrompt for FakePrompt {
        fn confirm_trust(&self, _hostname: &str, _fingerprint: &str, check: &TrustCheck) -> bool {
            let mut state = self.inner.borrow_mut();
            state.seen.push(check.clone());
            if let Some(flag) = &state.cancel_on_prompt {
                flag.cancel();
            }
            state.accept
        }
    }

    // ----- test harness -----

    struct Harness {
        _dir: tempfile::TempDir,
        config: LinkConfig,
        keys: MemoryKeys,
        service: FakeService,
        scheduler: FakeScheduler,
        sync: FakeSync,
        prompt: FakePrompt,
    }

    const HOST_FP: &str = "11:22:33:44";

    impl Harness {
        fn new() -> Self {
            Self::with(SyncMode::Success, FakePrompt::accepting())
        }

        fn with(sync_mode: SyncMode, prompt: FakePrompt) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = LinkConfig {
                config_dir: dir.path().to_path_buf(),
                sync_program: "rdiff-backup".into(),
                schedule_scope: ScheduleScope::User,
                backup_source: dir.path().to_path_buf(),
            };
            Self {
                _dir: dir,
                config,
                keys: MemoryKeys::default(),
                service: FakeService::new(HOST_FP),
                scheduler: FakeScheduler::default(),
                sync: FakeSync::new(sync_mode),
                prompt,
            }
        }

        fn controller(
            &self,
        ) -> LinkController<MemoryKeys, FakeService, FakeScheduler, FakeSync, FakePrompt> {
            LinkController::new(
                self.config.clone(),
                self.keys.clone(),
                self.service.clone(),
                self.scheduler.clone(),
                self.sync.clone(),
                self.prompt.clone(),
            )
        }

        fn request(name: &str) -> LinkRequest {
            LinkRequest {
                computer_name: name.into(),
                remote_url: "https://backup.example.com".into(),
                credentials: Credentials {
                    username: "alice".into(),
                    password: "secret".into(),
                },
                frequency: Frequency::Daily,
            }
        }

        fn state(&self) -> LinkState {
            StateFile::new(self.config.state_path()).load().unwrap()
        }
    }

    #[test]
    fn scenario_a_fresh_machine_links_end_to_end() {
        let h = Harness::new();
        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();

        assert!(matches!(outcome, LinkOutcome::Linked));
        assert_eq!(h.state(), LinkState::Linked);

        let settings = Settings::load(&h.config.settings_path()).unwrap();
        assert!(settings.configured);
        assert_eq!(settings.computer_name.as_deref(), Some("laptop-01"));
        assert_eq!(settings.link_token.as_deref(), Some("tok-laptop-01"));

        // First use: the Unknown prompt was shown exactly once and the
        // fingerprint is now trusted.
        assert_eq!(h.prompt.inner.borrow().seen, vec![TrustCheck::Unknown]);
        let store = TrustStore::load(&h.config.known_hosts_path()).unwrap();
        assert_eq!(
            store.evaluate("backup.example.com", HOST_FP),
            TrustCheck::Trusted
        );

        assert!(h.scheduler.inner.borrow().registered.is_some());
        assert_eq!(h.sync.inner.borrow().run_calls, 1);
        let last = StatusFile::new(h.config.status_path()).last_run().unwrap();
        assert_eq!(last.outcome, BackupOutcome::Success);
    }

    #[test]
    fn scenario_b_name_collision_keeps_identity() {
        let h = Harness::new();
        h.service
            .inner
            .borrow_mut()
            .taken_names
            .insert("laptop-01".into());

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::ComputerNameAlreadyInUse { ref name } if name == "laptop-01"
        ));
        assert_eq!(h.state(), LinkState::KeyGenerated);
        let fingerprint = h.keys.current_public_key().unwrap().fingerprint;

        // Retry with a free name: links without regenerating the key.
        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-02"), &CancelFlag::new())
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked));
        assert_eq!(h.keys.inner.borrow().generate_calls, 1);
        assert_eq!(h.keys.current_public_key().unwrap().fingerprint, fingerprint);
        let settings = Settings::load(&h.config.settings_path()).unwrap();
        assert_eq!(settings.computer_name.as_deref(), Some("laptop-02"));
    }

    #[test]
    fn scenario_c_declined_mismatch_aborts_without_schedule() {
        let h = Harness::with(SyncMode::Success, FakePrompt::declining());

        // The server was trusted before, under a different host key.
        let mut store = TrustStore::default();
        store.record_trust("backup.example.com", "aa:bb:cc:dd", 500);
        store.save(&h.config.known_hosts_path()).unwrap();

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();

        assert!(matches!(err, LinkError::UntrustedHostKey { .. }));
        assert_eq!(h.state(), LinkState::KeyExchanged);
        assert!(h.scheduler.inner.borrow().registered.is_none());
        assert!(matches!(
            h.prompt.inner.borrow().seen.as_slice(),
            [TrustCheck::Mismatched { .. }]
        ));
        // The stored fingerprint was not touched.
        let store = TrustStore::load(&h.config.known_hosts_path()).unwrap();
        assert_eq!(store.get("backup.example.com").unwrap().fingerprint, "aa:bb:cc:dd");
    }

    #[test]
    fn scenario_d_schedule_permission_failure_is_retryable() {
        let h = Harness::new();
        h.scheduler.inner.borrow_mut().fail_permission = true;

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::InsufficientPermissions));
        assert_eq!(h.state(), LinkState::TrustVerified);

        // Retry with rights in place: resumes at scheduling, no second
        // key exchange, no second prompt.
        h.scheduler.inner.borrow_mut().fail_permission = false;
        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked));
        assert_eq!(h.service.inner.borrow().exchange_calls, 1);
        assert_eq!(h.keys.inner.borrow().generate_calls, 1);
        assert_eq!(h.prompt.inner.borrow().seen.len(), 1);
        assert_eq!(h.scheduler.inner.borrow().register_calls, 2);
    }

    #[test]
    fn resume_after_validation_failure_reenters_phase_five_only() {
        let h = Harness::with(SyncMode::Missing, FakePrompt::accepting());

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::SyncToolMissing { .. }));
        assert_eq!(h.state(), LinkState::ScheduleRegistered);

        h.sync.inner.borrow_mut().mode = SyncMode::Success;
        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked));
        assert_eq!(h.keys.inner.borrow().generate_calls, 1);
        assert_eq!(h.service.inner.borrow().exchange_calls, 1);
        assert_eq!(h.scheduler.inner.borrow().register_calls, 1);
        assert_eq!(h.sync.inner.borrow().run_calls, 2);
    }

    #[test]
    fn generate_failure_persists_nothing() {
        let h = Harness::new();
        h.keys.inner.borrow_mut().fail_generate = true;

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::GenerateKey { .. }));
        assert_eq!(h.state(), LinkState::Unconfigured);
        assert!(!h.config.settings_path().exists());
    }

    #[test]
    fn transport_failure_is_wrapped_as_link_failure() {
        let h = Harness::new();
        h.service.inner.borrow_mut().fail_transport = true;

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();
        match err {
            LinkError::LinkComputer { source } => {
                assert!(matches!(*source, LinkError::ExchangeKey { .. }));
            }
            other => panic!("wrong variant: {other:?}"),
        }
        // Retryable with the same persisted state.
        assert_eq!(h.state(), LinkState::KeyGenerated);
    }

    #[test]
    fn cancellation_between_trust_and_schedule_preserves_progress() {
        let cancel = CancelFlag::new();
        let prompt = FakePrompt::accepting();
        prompt.inner.borrow_mut().cancel_on_prompt = Some(cancel.clone());
        let h = Harness::with(SyncMode::Success, prompt);

        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &cancel)
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Cancelled(LinkState::TrustVerified)));
        assert_eq!(h.state(), LinkState::TrustVerified);
        assert!(h.scheduler.inner.borrow().registered.is_none());

        // A fresh attempt resumes instead of redoing completed phases.
        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked));
        assert_eq!(h.service.inner.borrow().exchange_calls, 1);
    }

    #[test]
    fn trusted_host_skips_the_prompt() {
        let h = Harness::new();
        let mut store = TrustStore::default();
        store.record_trust("backup.example.com", HOST_FP, 500);
        store.save(&h.config.known_hosts_path()).unwrap();

        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked));
        assert!(h.prompt.inner.borrow().seen.is_empty());
    }

    #[test]
    fn concurrent_link_attempt_is_rejected() {
        let h = Harness::new();
        let _held = LockGuard::acquire(&h.config.lock_path()).unwrap();

        let err = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, LinkError::MissConfigured { .. }));
        assert_eq!(h.state(), LinkState::Unconfigured);
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_from_a_crashed_attempt_does_not_block() {
        let h = Harness::new();
        // Leftover lock file with no living holder, as after a SIGKILL or
        // power loss mid-link.
        std::fs::create_dir_all(&h.config.config_dir).unwrap();
        std::fs::write(h.config.lock_path(), b"").unwrap();

        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked));
    }

    #[test]
    fn lock_is_released_after_an_attempt() {
        let h = Harness::new();
        h.controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        // A follow-up operation can take the lock again.
        assert!(LockGuard::acquire(&h.config.lock_path()).is_ok());
    }

    #[test]
    fn failed_validation_backup_keeps_the_link() {
        let h = Harness::with(SyncMode::Failure, FakePrompt::accepting());

        let outcome = h
            .controller()
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        match outcome {
            LinkOutcome::LinkedWithWarning(warning) => {
                assert!(matches!(warning, LinkError::InitialBackupFailed { .. }));
            }
            other => panic!("wrong outcome: {other:?}"),
        }
        assert_eq!(h.state(), LinkState::Linked);
        assert!(h.scheduler.inner.borrow().registered.is_some());
        let settings = Settings::load(&h.config.settings_path()).unwrap();
        assert!(settings.configured);

        // The failed validation run can be retried on its own.
        h.sync.inner.borrow_mut().mode = SyncMode::Success;
        let result = h.controller().run_backup().unwrap();
        assert_eq!(result.outcome, BackupOutcome::Success);
    }

    #[test]
    fn status_distinguishes_never_ran_from_failed() {
        let h = Harness::new();
        let controller = h.controller();

        // Fresh machine: unconfigured, no schedule, no backup.
        let report = controller.status().unwrap();
        assert_eq!(report.state, LinkState::Unconfigured);
        assert!(report.schedule.is_none());
        assert!(report.last_backup.is_none());

        controller
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();
        let report = controller.status().unwrap();
        assert_eq!(report.state, LinkState::Linked);
        assert_eq!(report.schedule.unwrap().frequency, Frequency::Daily);
        assert_eq!(
            report.last_backup.unwrap().outcome,
            BackupOutcome::Success
        );
    }

    #[test]
    fn run_backup_unlinked_is_not_configured() {
        let h = Harness::new();
        let err = h.controller().run_backup().unwrap_err();
        assert!(matches!(err, LinkError::NotConfigured { .. }));
        assert!(err.is_expected_absence());
    }

    #[test]
    fn unlink_clears_local_state_and_revokes_token() {
        let h = Harness::new();
        let controller = h.controller();
        controller
            .start_link(&Harness::request("laptop-01"), &CancelFlag::new())
            .unwrap();

        controller.unlink().unwrap();
        assert_eq!(h.state(), LinkState::Unconfigured);
        assert!(h.scheduler.inner.borrow().registered.is_none());
        assert!(matches!(
            h.keys.current_public_key().unwrap_err(),
            LinkError::NotConfigured { .. }
        ));
        assert_eq!(h.service.inner.borrow().revoked, vec!["tok-laptop-01"]);
        // Trust records survive the unlink.
        let store = TrustStore::load(&h.config.known_hosts_path()).unwrap();
        assert!(store.get("backup.example.com").is_some());

        // Unlinking an unlinked machine succeeds silently.
        controller.unlink().unwrap();
    }
}
