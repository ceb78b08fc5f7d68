//! Ankor CLI
//!
//! Links this machine to a remote backup account and manages the result:
//! `link`, `status`, `unlink`, `backup`. The link pipeline runs as one
//! cancellable unit on the main thread; Ctrl-C is honored between phases
//! and already-completed phases are preserved for a later resume.

use std::io::{self, Write};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ankor_core::config::{Frequency, LinkConfig};
use ankor_core::error::LinkError;
use ankor_core::state::LinkState;
use ankor_core::status::BackupOutcome;
use ankor_core::tracing_init::init_tracing;
use ankor_crypto::TrustCheck;
use ankor_link::{
    CancelFlag, Credentials, ExternalSyncTool, FileKeyManager, LinkController, LinkOutcome,
    LinkRequest, LinkServiceClient, SystemdScheduler, TrustPrompt,
};

#[derive(Parser, Debug)]
#[command(name = "ankor")]
#[command(version, about = "Link this machine to a remote backup account", long_about = None)]
struct Cli {
    /// Emit structured JSON log lines instead of the human-readable format
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Link this machine to a backup account and run the validation backup
    Link {
        /// Computer name to register (unique within the account)
        #[arg(long)]
        name: String,

        /// Base URL of the remote backup service
        #[arg(long)]
        remote: String,

        /// Account username
        #[arg(long)]
        username: String,

        /// Account password (prompted interactively when not set)
        #[arg(long, env = "ANKOR_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Backup frequency
        #[arg(long, value_enum, default_value_t = FrequencyArg::Daily)]
        frequency: FrequencyArg,
    },
    /// Show the link state and the last backup outcome
    Status,
    /// Disconnect this machine from the backup account
    Unlink {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Run one backup pass now
    Backup,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FrequencyArg {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl From<FrequencyArg> for Frequency {
    fn from(arg: FrequencyArg) -> Self {
        match arg {
            FrequencyArg::Hourly => Self::Hourly,
            FrequencyArg::Daily => Self::Daily,
            FrequencyArg::Weekly => Self::Weekly,
            FrequencyArg::Monthly => Self::Monthly,
        }
    }
}

/// Interactive trust decision over the terminal. Warns much louder when a
/// previously trusted host presents a different key than on first contact.
struct DialoguerTrustPrompt;

impl TrustPrompt for DialoguerTrustPrompt {
    fn confirm_trust(&self, hostname: &str, fingerprint: &str, check: &TrustCheck) -> bool {
        let mut out = io::stderr();
        match check {
            TrustCheck::Mismatched { expected, .. } => {
                writeln!(out, "WARNING: the host key of {hostname} has CHANGED!").ok();
                writeln!(out, "  previously trusted: {expected}").ok();
                writeln!(out, "  observed now:       {fingerprint}").ok();
                writeln!(
                    out,
                    "This may be a man-in-the-middle attack, or the server rotated its key."
                )
                .ok();
            }
            _ => {
                writeln!(out, "The authenticity of host {hostname} can't be established.").ok();
                writeln!(out, "  fingerprint: {fingerprint}").ok();
            }
        }
        dialoguer::Confirm::new()
            .with_prompt("Do you trust this host and want to continue?")
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

type Controller = LinkController<
    FileKeyManager,
    LinkServiceClient,
    SystemdScheduler,
    ExternalSyncTool,
    DialoguerTrustPrompt,
>;

fn build_controller(config: LinkConfig, remote_url: &str) -> anyhow::Result<Controller> {
    let keys = FileKeyManager::new(config.identity_path());
    let service = LinkServiceClient::new(remote_url)?;
    let scheduler = SystemdScheduler::new(config.schedule_scope);
    let sync = ExternalSyncTool::new(config.sync_program.clone(), config.backup_source.clone());
    Ok(LinkController::new(
        config,
        keys,
        service,
        scheduler,
        sync,
        DialoguerTrustPrompt,
    ))
}

// main is synchronous on purpose. The controller owns a blocking HTTP
// client, and a blocking client must never be used or dropped on a tokio
// runtime thread. The only async piece is the Ctrl-C listener, hosted by
// a small runtime inside `link_with_ctrl_c`.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("ankor=info", cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "starting ankor");

    let config = LinkConfig::resolve()?;
    match cli.command {
        Command::Link {
            name,
            remote,
            username,
            password,
            frequency,
        } => {
            let password = match password {
                Some(p) => p,
                None => dialoguer::Password::new()
                    .with_prompt(format!("Password for {username}"))
                    .interact()?,
            };
            let request = LinkRequest {
                computer_name: name,
                remote_url: remote.clone(),
                credentials: Credentials { username, password },
                frequency: frequency.into(),
            };
            let controller = build_controller(config, &remote)?;
            run_link(&controller, &request)
        }
        Command::Status => {
            let controller = build_controller(config, "http://unused.invalid")?;
            print_status(&controller)
        }
        Command::Unlink { yes } => {
            let settings = ankor_core::Settings::load(&config.settings_path())?;
            let remote = settings
                .remote_url
                .clone()
                .unwrap_or_else(|| "http://unused.invalid".into());
            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(
                        "Disconnect this machine? Its identity is erased and scheduled \
                         backups stop running.",
                    )
                    .default(false)
                    .interact()?;
                if !confirmed {
                    return Ok(());
                }
            }
            let controller = build_controller(config, &remote)?;
            controller.unlink()?;
            writeln!(io::stdout(), "This machine is no longer linked.")?;
            Ok(())
        }
        Command::Backup => {
            let settings = ankor_core::Settings::load(&config.settings_path())?;
            let remote = settings
                .remote_url
                .clone()
                .unwrap_or_else(|| "http://unused.invalid".into());
            let controller = build_controller(config, &remote)?;
            let result = controller.run_backup()?;
            let mut out = io::stdout();
            match result.outcome {
                BackupOutcome::Success => writeln!(out, "Backup completed successfully.")?,
                BackupOutcome::Partial => writeln!(
                    out,
                    "Backup completed, but some files were skipped: {}",
                    result.detail.as_deref().unwrap_or("no details")
                )?,
                BackupOutcome::Failure => anyhow::bail!(
                    "backup failed: {}",
                    result.detail.as_deref().unwrap_or("no details")
                ),
            }
            Ok(())
        }
    }
}

/// Run the pipeline on the calling thread while a single-worker runtime
/// hosts the Ctrl-C listener. Cancellation takes effect at the next phase
/// boundary; completed phases stay on disk for a later resume.
fn link_with_ctrl_c(
    controller: &Controller,
    request: &LinkRequest,
) -> Result<LinkOutcome, LinkError> {
    let cancel = CancelFlag::new();
    let signal_flag = cancel.clone();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("cancellation requested, finishing the current phase");
            signal_flag.cancel();
        }
    });

    let outcome = controller.start_link(request, &cancel);
    runtime.shutdown_background();
    outcome
}

fn run_link(controller: &Controller, request: &LinkRequest) -> anyhow::Result<()> {
    let outcome = link_with_ctrl_c(controller, request);

    let mut out = io::stdout();
    match outcome {
        Ok(LinkOutcome::Linked) => {
            writeln!(out, "Linked successfully. The initial backup completed.")?;
            Ok(())
        }
        Ok(LinkOutcome::LinkedWithWarning(warning)) => {
            writeln!(
                out,
                "Linked, but the initial backup did not complete: {warning}"
            )?;
            writeln!(out, "Run `ankor backup` to retry it; the link is kept.")?;
            Ok(())
        }
        Ok(LinkOutcome::Cancelled(state)) => {
            writeln!(
                out,
                "Cancelled after \"{state}\". Run `ankor link` again to resume."
            )?;
            Ok(())
        }
        Err(LinkError::ComputerNameAlreadyInUse { name }) => {
            anyhow::bail!("the name {name:?} is already in use — pick another and retry")
        }
        Err(LinkError::UntrustedHostKey { hostname, .. }) => {
            anyhow::bail!("aborted: the host key of {hostname} was not trusted")
        }
        Err(e) => Err(e.into()),
    }
}

fn print_status(controller: &Controller) -> anyhow::Result<()> {
    let report = controller.status()?;
    let mut out = io::stdout();
    writeln!(out, "Link state: {}", report.state)?;
    if let (Some(username), Some(host), Some(name)) = (
        &report.settings.username,
        &report.settings.remote_host,
        &report.settings.computer_name,
    ) {
        writeln!(out, "Remote:     {username}@{host}::{name}")?;
    }
    match &report.schedule {
        Some(entry) if entry.enabled => {
            writeln!(out, "Schedule:   {:?}", entry.frequency)?;
        }
        Some(_) => writeln!(out, "Schedule:   registered but disabled")?,
        None => writeln!(out, "Schedule:   none")?,
    }
    match report.last_backup {
        Some(last) => {
            let outcome = match last.outcome {
                BackupOutcome::Success => "success",
                BackupOutcome::Partial => "partial",
                BackupOutcome::Failure => "failure",
            };
            writeln!(out, "Last backup: {outcome}")?;
            if let Some(detail) = last.detail {
                writeln!(out, "  {detail}")?;
            }
        }
        None if report.state == LinkState::Linked => {
            writeln!(out, "Last backup: the initial backup has not run yet")?;
        }
        None => {
            writeln!(out, "Last backup: none — this machine is not linked")?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use ankor_core::config::ScheduleScope;

    // The controller owns a blocking HTTP client. Building it, driving a
    // request through it and dropping it must all happen off the async
    // runtime; this runs the whole execution path the way `main` does,
    // with the signal runtime alive next to it.
    #[test]
    fn pipeline_runs_off_the_signal_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkConfig {
            config_dir: dir.path().to_path_buf(),
            sync_program: "rdiff-backup".into(),
            schedule_scope: ScheduleScope::User,
            backup_source: dir.path().to_path_buf(),
        };
        // Port 1 on loopback refuses immediately.
        let controller = build_controller(config, "http://127.0.0.1:1").unwrap();
        let request = LinkRequest {
            computer_name: "laptop-01".into(),
            remote_url: "http://127.0.0.1:1".into(),
            credentials: Credentials {
                username: "alice".into(),
                password: "secret".into(),
            },
            frequency: Frequency::Daily,
        };

        let err = link_with_ctrl_c(&controller, &request).unwrap_err();
        assert!(matches!(err, LinkError::LinkComputer { .. }));
        drop(controller);
    }
}
