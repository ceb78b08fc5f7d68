//! Recurring schedule registration in the OS scheduler.
//!
//! On Linux the backend is a systemd timer: a `.service`/`.timer` unit pair
//! written to the user (or system) unit directory, then enabled through
//! `systemctl`. Native failures are translated into the domain taxonomy so
//! the controller never sees raw exit codes:
//!
//! - denials detected before the native call → `InsufficientPermissions`
//! - no usable scheduler on this OS → `UnsupportedOs`
//! - anything surfacing from the native call → `MissConfigured`
//! - no unit installed → `ScheduleNotFound` (expected while unlinked)

use ankor_core::config::{Frequency, ScheduleScope};
use ankor_core::error::{LinkError, Result};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use std::process::Command;

/// Unit base name for the recurring backup trigger.
pub const UNIT_NAME: &str = "ankor-backup";

/// A recurring execution trigger. The OS scheduler owns the real entry;
/// this is only the view we register and read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub frequency: Frequency,
    /// Command line the scheduler runs on each trigger.
    pub command: String,
    pub enabled: bool,
}

/// Capability interface over the OS task scheduler.
pub trait Scheduler {
    /// Create or update the recurring trigger.
    fn register_schedule(&self, entry: &ScheduleEntry) -> Result<()>;

    /// The installed trigger, or `ScheduleNotFound` when none exists for
    /// this installation.
    fn find_schedule(&self) -> Result<ScheduleEntry>;

    /// Remove the trigger. Removing an absent schedule succeeds silently.
    fn remove_schedule(&self) -> Result<()>;
}

/// systemd calendar expression for a frequency tier.
const fn on_calendar(frequency: Frequency) -> &'static str {
    match frequency {
        Frequency::Hourly => "hourly",
        Frequency::Daily => "daily",
        Frequency::Weekly => "weekly",
        Frequency::Monthly => "monthly",
    }
}

fn frequency_from_calendar(expr: &str) -> Option<Frequency> {
    match expr {
        "hourly" => Some(Frequency::Hourly),
        "daily" => Some(Frequency::Daily),
        "weekly" => Some(Frequency::Weekly),
        "monthly" => Some(Frequency::Monthly),
        _ => None,
    }
}

/// Generate the service unit triggered by the timer.
fn render_service(command: &str) -> String {
    format!(
        r"[Unit]
Description=Ankor backup run

[Service]
Type=oneshot
ExecStart={command}
",
    )
}

/// Generate the timer unit.
fn render_timer(frequency: Frequency) -> String {
    format!(
        r"[Unit]
Description=Ankor recurring backup trigger

[Timer]
OnCalendar={calendar}
Persistent=true

[Install]
WantedBy=timers.target
",
        calendar = on_calendar(frequency),
    )
}

/// Classify a failed `systemctl` invocation from its stderr. Denials
/// surfacing from the native call read as a configuration problem;
/// `InsufficientPermissions` is reserved for rights problems detected
/// before the call (scope check, unit file writes).
fn classify_native_failure(action: &str, stderr: &str) -> LinkError {
    LinkError::MissConfigured {
        message: format!("{action} failed: {}", stderr.trim()),
        source: None,
    }
}

/// Scheduler backend over systemd timers.
#[derive(Debug, Clone)]
pub struct SystemdScheduler {
    scope: ScheduleScope,
}

impl SystemdScheduler {
    pub const fn new(scope: ScheduleScope) -> Self {
        Self { scope }
    }
}

#[cfg(unix)]
impl SystemdScheduler {
    fn unit_dir(&self) -> Result<PathBuf> {
        match self.scope {
            ScheduleScope::System => Ok(PathBuf::from("/etc/systemd/system")),
            ScheduleScope::User => {
                let home = dirs::home_dir().ok_or_else(|| LinkError::MissConfigured {
                    message: "cannot determine home directory".into(),
                    source: None,
                })?;
                Ok(home.join(".config/systemd/user"))
            }
        }
    }

    fn service_path(&self) -> Result<PathBuf> {
        Ok(self.unit_dir()?.join(format!("{UNIT_NAME}.service")))
    }

    fn timer_path(&self) -> Result<PathBuf> {
        Ok(self.unit_dir()?.join(format!("{UNIT_NAME}.timer")))
    }

    /// Pre-call environment checks shared by every operation.
    fn ensure_available(&self) -> Result<()> {
        let have_systemctl = Command::new("which")
            .arg("systemctl")
            .output()
            .is_ok_and(|o| o.status.success());
        if !have_systemctl {
            return Err(LinkError::UnsupportedOs {
                os: std::env::consts::OS.to_string(),
            });
        }
        // System-wide registration needs root, observable before any
        // native call is attempted.
        if self.scope == ScheduleScope::System && !nix::unistd::geteuid().is_root() {
            return Err(LinkError::InsufficientPermissions);
        }
        Ok(())
    }

    fn systemctl(&self, action: &str, args: &[&str]) -> Result<()> {
        let mut full: Vec<&str> = Vec::new();
        if self.scope == ScheduleScope::User {
            full.push("--user");
        }
        full.extend_from_slice(args);
        tracing::debug!("exec: systemctl {}", full.join(" "));

        let output = Command::new("systemctl").args(&full).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_native_failure(
                action,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn write_unit(&self, path: &std::path::Path, content: &str) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(map_write_error)?;
        }
        std::fs::write(path, content).map_err(map_write_error)
    }
}

#[cfg(unix)]
fn map_write_error(e: std::io::Error) -> LinkError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        LinkError::InsufficientPermissions
    } else {
        LinkError::Io(e)
    }
}

#[cfg(unix)]
impl Scheduler for SystemdScheduler {
    fn register_schedule(&self, entry: &ScheduleEntry) -> Result<()> {
        self.ensure_available()?;

        self.write_unit(&self.service_path()?, &render_service(&entry.command))?;
        self.write_unit(&self.timer_path()?, &render_timer(entry.frequency))?;

        self.systemctl("reloading systemd units", &["daemon-reload"])?;
        let timer_unit = format!("{UNIT_NAME}.timer");
        if entry.enabled {
            self.systemctl("enabling the backup timer", &["enable", "--now", &timer_unit])?;
        } else {
            self.systemctl("disabling the backup timer", &["disable", "--now", &timer_unit])?;
        }
        tracing::info!(
            frequency = ?entry.frequency,
            enabled = entry.enabled,
            "registered backup schedule"
        );
        Ok(())
    }

    fn find_schedule(&self) -> Result<ScheduleEntry> {
        self.ensure_available()?;

        let timer = match std::fs::read_to_string(self.timer_path()?) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LinkError::ScheduleNotFound);
            }
            Err(e) => return Err(e.into()),
        };
        let service = match std::fs::read_to_string(self.service_path()?) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LinkError::ScheduleNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let frequency = timer
            .lines()
            .find_map(|l| l.strip_prefix("OnCalendar="))
            .and_then(|expr| frequency_from_calendar(expr.trim()))
            .ok_or_else(|| LinkError::MissConfigured {
                message: "backup timer unit has no recognisable OnCalendar entry".into(),
                source: None,
            })?;
        let command = service
            .lines()
            .find_map(|l| l.strip_prefix("ExecStart="))
            .map(str::trim)
            .ok_or_else(|| LinkError::MissConfigured {
                message: "backup service unit has no ExecStart entry".into(),
                source: None,
            })?
            .to_string();

        let timer_unit = format!("{UNIT_NAME}.timer");
        let enabled = self
            .systemctl("probing the backup timer", &["is-enabled", "--quiet", &timer_unit])
            .is_ok();

        Ok(ScheduleEntry {
            frequency,
            command,
            enabled,
        })
    }

    fn remove_schedule(&self) -> Result<()> {
        self.ensure_available()?;

        let timer_unit = format!("{UNIT_NAME}.timer");
        // Best effort: the unit may not be loaded at all.
        if self
            .systemctl("disabling the backup timer", &["disable", "--now", &timer_unit])
            .is_err()
        {
            tracing::debug!("backup timer was not enabled");
        }
        for path in [self.timer_path()?, self.service_path()?] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(map_write_error(e)),
            }
        }
        self.systemctl("reloading systemd units", &["daemon-reload"])?;
        Ok(())
    }
}

#[cfg(not(unix))]
impl Scheduler for SystemdScheduler {
    fn register_schedule(&self, _entry: &ScheduleEntry) -> Result<()> {
        Err(LinkError::UnsupportedOs {
            os: std::env::consts::OS.to_string(),
        })
    }

    fn find_schedule(&self) -> Result<ScheduleEntry> {
        Err(LinkError::UnsupportedOs {
            os: std::env::consts::OS.to_string(),
        })
    }

    fn remove_schedule(&self) -> Result<()> {
        Err(LinkError::UnsupportedOs {
            os: std::env::consts::OS.to_string(),
        })
    }
}
