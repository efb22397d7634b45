use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::alert::{AlertChannel, SyslogScope};
use crate::error::{BackupkitError, Result};
use crate::exit::ExitCallbacks;
use crate::types::ExitCodes;
use crate::util::paths::{is_younger_than, remove_file_if_exists, touch};

pub mod admin;

pub const DISABLED_MARKER: &str = "scriptdisabled";
pub const SILENCED_MARKER: &str = "lfalertssilenced";

const REMOVE_LOCK_ACTION: &str = "remove_lockfile";

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub lock_dir: PathBuf,
    pub started_file: PathBuf,
    pub alert_file: PathBuf,
    pub run_every_minutes: u64,
    pub alert_interval_minutes: u64,
    pub no_email_on_repeat: bool,
    pub exit_codes: ExitCodes,
}

impl GateSettings {
    pub fn disabled_marker(&self) -> PathBuf {
        self.lock_dir.join(DISABLED_MARKER)
    }

    pub fn silenced_marker(&self) -> PathBuf {
        self.lock_dir.join(SILENCED_MARKER)
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    IntervalNotExpired,
    Disabled,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Abort { code: i32, reason: AbortReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepeatTier {
    NoEmailOnRepeat,
    Silenced,
    TooSoon,
    Resend,
}

pub struct RunGate {
    settings: GateSettings,
    alerts: AlertChannel,
    callbacks: ExitCallbacks,
}

impl RunGate {
    pub fn new(settings: GateSettings, alerts: AlertChannel, callbacks: ExitCallbacks) -> Self {
        callbacks.define(REMOVE_LOCK_ACTION, |args| {
            let (Some(lock_dir), Some(marker)) = (args.first(), args.get(1)) else {
                return Err(BackupkitError::message(
                    "remove_lockfile needs the lockfile and disabled marker paths",
                ));
            };
            remove_lock_unless_disabled(Path::new(lock_dir), Path::new(marker))
        });
        Self {
            settings,
            alerts,
            callbacks,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn check_status(&self, purpose: &str, purpose_plural: &str) -> Result<GateDecision> {
        let codes = self.settings.exit_codes;
        if self.settings.run_every_minutes != 0
            && is_younger_than(
                &self.settings.started_file,
                minutes(self.settings.run_every_minutes),
            )?
        {
            self.alerts.log_status(
                &format!(
                    "{} skipped: the last one started less than {} minutes ago",
                    purpose, self.settings.run_every_minutes
                ),
                SyslogScope::AllOnly,
            );
            return Ok(GateDecision::Abort {
                code: codes.no_error,
                reason: AbortReason::IntervalNotExpired,
            });
        }

        self.lock_or_alert(purpose, purpose_plural, true)
    }

    pub fn acquire(&self, purpose: &str, purpose_plural: &str) -> Result<GateDecision> {
        self.lock_or_alert(purpose, purpose_plural, false)
    }

    fn lock_or_alert(
        &self,
        purpose: &str,
        purpose_plural: &str,
        mark_started: bool,
    ) -> Result<GateDecision> {
        let codes = self.settings.exit_codes;
        if self.try_create_lock()? {
            self.on_lock_acquired(purpose, mark_started)?;
            return Ok(GateDecision::Proceed);
        }

        let disabled = self.settings.disabled_marker().exists();
        let (message, reason) = if disabled {
            (
                format!(
                    "{} are disabled: {} exists (run `enable` to re-enable)",
                    purpose_plural,
                    self.settings.disabled_marker().display()
                ),
                AbortReason::Disabled,
            )
        } else {
            (
                format!(
                    "lockfile {} exists: a previous {} is still running or crashed",
                    self.settings.lock_dir.display(),
                    purpose
                ),
                AbortReason::Locked,
            )
        };
        self.alerts.log_alert(&message, SyslogScope::Normal);
        let abort = GateDecision::Abort {
            code: codes.lockfile_error,
            reason,
        };

        if !self.settings.alert_file.exists() {
            touch(&self.settings.alert_file)?;
            self.alerts.send_alert(&message, &self.alert_context(), false);
            return Ok(abort);
        }

        match self.repeat_tier()? {
            RepeatTier::NoEmailOnRepeat => self.alerts.log_status(
                "repeat alert not emailed (noEmailOnRepeat is set)",
                SyslogScope::AllOnly,
            ),
            RepeatTier::Silenced => self.alerts.log_status(
                &format!(
                    "repeat alert not emailed: alerts silenced by {}",
                    self.settings.silenced_marker().display()
                ),
                SyslogScope::AllOnly,
            ),
            RepeatTier::TooSoon => self.alerts.log_status(
                &format!(
                    "repeat alert not emailed: last alert less than {} minutes ago",
                    self.settings.alert_interval_minutes
                ),
                SyslogScope::AllOnly,
            ),
            RepeatTier::Resend => {
                touch(&self.settings.alert_file)?;
                self.alerts.send_alert(&message, &self.alert_context(), false);
            }
        }
        Ok(abort)
    }

    fn try_create_lock(&self) -> Result<bool> {
        let lock_dir = &self.settings.lock_dir;
        if let Some(parent) = lock_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BackupkitError::message(format!("create {}: {}", parent.display(), e))
            })?;
        }
        match fs::create_dir(lock_dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(BackupkitError::message(format!(
                "create lockfile {}: {}",
                lock_dir.display(),
                err
            ))),
        }
    }

    fn on_lock_acquired(&self, purpose: &str, mark_started: bool) -> Result<()> {
        let lock_dir = self.settings.lock_dir.to_string_lossy().to_string();
        let marker = self.settings.disabled_marker().to_string_lossy().to_string();
        if !self.callbacks.register(REMOVE_LOCK_ACTION, &[lock_dir, marker]) {
            return Err(BackupkitError::message(
                "could not register lockfile removal",
            ));
        }
        debug!(lock = %self.settings.lock_dir.display(), "lockfile acquired");
        if remove_file_if_exists(&self.settings.alert_file)? {
            self.alerts.send_alert(
                &format!(
                    "lockfile {} regained; {} running again",
                    self.settings.lock_dir.display(),
                    purpose
                ),
                "",
                true,
            );
        }
        if mark_started {
            touch(&self.settings.started_file)?;
        }
        Ok(())
    }

    fn repeat_tier(&self) -> Result<RepeatTier> {
        if self.settings.no_email_on_repeat {
            return Ok(RepeatTier::NoEmailOnRepeat);
        }
        if self.settings.silenced_marker().exists() {
            return Ok(RepeatTier::Silenced);
        }
        if is_younger_than(
            &self.settings.alert_file,
            minutes(self.settings.alert_interval_minutes),
        )? {
            return Ok(RepeatTier::TooSoon);
        }
        Ok(RepeatTier::Resend)
    }

    fn alert_context(&self) -> String {
        format!(
            "lockfile: {}\n\
             Further emails are sent at most every {} minutes while the lockfile stays.\n\
             Silence them by creating {}, or remove the lockfile once no run is active.",
            self.settings.lock_dir.display(),
            self.settings.alert_interval_minutes,
            self.settings.silenced_marker().display()
        )
    }
}

/// Remove the lockfile unless it has been disabled in the meantime. The
/// marker is checked now, not when the lock was taken.
fn remove_lock_unless_disabled(lock_dir: &Path, marker: &Path) -> Result<()> {
    if marker.exists() {
        debug!(lock = %lock_dir.display(), "disabled; lockfile kept");
        return Ok(());
    }
    match fs::remove_dir_all(lock_dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BackupkitError::message(format!(
            "remove lockfile {}: {}",
            lock_dir.display(),
            err
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alert::testing::{recording_channel, RecordingMailer};
    use std::fs::File;
    use std::sync::{Arc, Barrier};
    use std::time::SystemTime;
    use tempfile::TempDir;

    pub(crate) fn settings_in(dir: &Path) -> GateSettings {
        GateSettings {
            lock_dir: dir.join("lockfile"),
            started_file: dir.join("startedfile"),
            alert_file: dir.join("alertfile"),
            run_every_minutes: 0,
            alert_interval_minutes: 60,
            no_email_on_repeat: false,
            exit_codes: ExitCodes::default(),
        }
    }

    fn gate(settings: GateSettings) -> (RunGate, RecordingMailer, ExitCallbacks) {
        let (alerts, mailer, _syslog) = recording_channel(None);
        let callbacks = ExitCallbacks::new();
        (RunGate::new(settings, alerts, callbacks.clone()), mailer, callbacks)
    }

    fn backdate(path: &Path, minutes: u64) {
        File::options()
            .write(true)
            .open(path)
            .expect("open")
            .set_modified(SystemTime::now() - Duration::from_secs(minutes * 60))
            .expect("set mtime");
    }

    fn locked(code: i32) -> GateDecision {
        GateDecision::Abort {
            code,
            reason: AbortReason::Locked,
        }
    }

    #[test]
    fn proceed_takes_lock_and_cleanup_releases_it() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        let (gate, mailer, callbacks) = gate(settings.clone());
        assert_eq!(gate.check_status("backup", "backups").expect("check"), GateDecision::Proceed);
        assert!(settings.lock_dir.is_dir());
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks.finish(0), 0);
        assert!(!settings.lock_dir.exists());
        assert_eq!(mailer.count(), 0);
    }

    #[test]
    fn interval_short_circuits_with_no_error() {
        let dir = TempDir::new().expect("tempdir");
        let mut settings = settings_in(dir.path());
        settings.run_every_minutes = 60;
        let (first, _mailer, callbacks) = gate(settings.clone());
        assert_eq!(first.check_status("backup", "backups").expect("check"), GateDecision::Proceed);
        callbacks.finish(0);
        assert!(settings.started_file.exists());

        let (second, mailer, _callbacks) = gate(settings.clone());
        assert_eq!(
            second.check_status("backup", "backups").expect("check"),
            GateDecision::Abort {
                code: 0,
                reason: AbortReason::IntervalNotExpired
            }
        );
        assert!(!settings.lock_dir.exists());
        assert_eq!(mailer.count(), 0);
    }

    #[test]
    fn expired_interval_proceeds() {
        let dir = TempDir::new().expect("tempdir");
        let mut settings = settings_in(dir.path());
        settings.run_every_minutes = 60;
        touch(&settings.started_file).expect("touch");
        backdate(&settings.started_file, 61);
        let (gate, _mailer, _callbacks) = gate(settings);
        assert_eq!(gate.check_status("backup", "backups").expect("check"), GateDecision::Proceed);
    }

    #[test]
    fn acquire_ignores_interval_and_keeps_started_file() {
        let dir = TempDir::new().expect("tempdir");
        let mut settings = settings_in(dir.path());
        settings.run_every_minutes = 60;
        touch(&settings.started_file).expect("touch");
        backdate(&settings.started_file, 10);
        let before = fs::metadata(&settings.started_file)
            .and_then(|m| m.modified())
            .expect("mtime");

        let (gate, _mailer, callbacks) = gate(settings.clone());
        assert_eq!(gate.acquire("rotation", "rotations").expect("acquire"), GateDecision::Proceed);
        assert!(settings.lock_dir.is_dir());
        let after = fs::metadata(&settings.started_file)
            .and_then(|m| m.modified())
            .expect("mtime");
        assert_eq!(before, after);
        callbacks.finish(0);
        assert!(!settings.lock_dir.exists());
    }

    #[test]
    fn crashed_run_alerts_once_then_waits_for_interval() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        fs::create_dir(&settings.lock_dir).expect("mkdir");

        let (first, mailer, callbacks) = gate(settings.clone());
        assert_eq!(first.check_status("backup", "backups").expect("check"), locked(11));
        assert_eq!(mailer.count(), 1);
        assert!(settings.alert_file.exists());
        assert!(callbacks.is_empty());

        let (second, mailer, _callbacks) = gate(settings.clone());
        assert_eq!(second.check_status("backup", "backups").expect("check"), locked(11));
        assert_eq!(mailer.count(), 0);
        assert!(settings.lock_dir.is_dir());
    }

    #[test]
    fn repeat_alert_after_interval_refreshes_alert_file() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        fs::create_dir(&settings.lock_dir).expect("mkdir");
        touch(&settings.alert_file).expect("touch");
        backdate(&settings.alert_file, 61);

        let (gate, mailer, _callbacks) = gate(settings.clone());
        assert_eq!(gate.check_status("backup", "backups").expect("check"), locked(11));
        assert_eq!(mailer.count(), 1);
        assert!(is_younger_than(&settings.alert_file, minutes(1)).expect("age"));
    }

    #[test]
    fn silenced_alerts_are_only_logged() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        fs::create_dir(&settings.lock_dir).expect("mkdir");
        touch(&settings.silenced_marker()).expect("touch");
        touch(&settings.alert_file).expect("touch");
        backdate(&settings.alert_file, 600);

        let (gate, mailer, _callbacks) = gate(settings.clone());
        assert_eq!(gate.check_status("backup", "backups").expect("check"), locked(11));
        assert_eq!(mailer.count(), 0);
    }

    #[test]
    fn no_email_on_repeat_wins_over_expired_interval() {
        let dir = TempDir::new().expect("tempdir");
        let mut settings = settings_in(dir.path());
        settings.no_email_on_repeat = true;
        fs::create_dir(&settings.lock_dir).expect("mkdir");
        touch(&settings.alert_file).expect("touch");
        backdate(&settings.alert_file, 600);

        let (gate, mailer, _callbacks) = gate(settings);
        assert_eq!(gate.check_status("backup", "backups").expect("check"), locked(11));
        assert_eq!(mailer.count(), 0);
    }

    #[test]
    fn disabled_lock_reports_disabled() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        fs::create_dir(&settings.lock_dir).expect("mkdir");
        touch(&settings.disabled_marker()).expect("touch");

        let (gate, mailer, _callbacks) = gate(settings);
        assert_eq!(
            gate.check_status("backup", "backups").expect("check"),
            GateDecision::Abort {
                code: 11,
                reason: AbortReason::Disabled
            }
        );
        assert_eq!(mailer.count(), 1);
        assert!(mailer.subjects()[0].contains("backups are disabled"));
    }

    #[test]
    fn regained_lock_clears_alert_and_notifies() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        touch(&settings.alert_file).expect("touch");

        let (gate, mailer, _callbacks) = gate(settings.clone());
        assert_eq!(gate.check_status("backup", "backups").expect("check"), GateDecision::Proceed);
        assert!(!settings.alert_file.exists());
        assert_eq!(mailer.count(), 1);
        assert!(mailer.subjects()[0].contains("regained"));
    }

    #[test]
    fn disabling_during_run_keeps_lock_at_exit() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        let (gate, _mailer, callbacks) = gate(settings.clone());
        assert_eq!(gate.check_status("backup", "backups").expect("check"), GateDecision::Proceed);
        touch(&settings.disabled_marker()).expect("touch");
        callbacks.finish(0);
        assert!(settings.disabled_marker().exists());
    }

    #[test]
    fn concurrent_checks_admit_exactly_one() {
        let dir = TempDir::new().expect("tempdir");
        let settings = settings_in(dir.path());
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let settings = settings.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let (alerts, _mailer, _syslog) = recording_channel(None);
                    let gate = RunGate::new(settings, alerts, ExitCallbacks::new());
                    barrier.wait();
                    gate.check_status("backup", "backups").expect("check")
                })
            })
            .collect();
        let decisions: Vec<GateDecision> =
            handles.into_iter().map(|h| h.join().expect("join")).collect();
        let proceeded = decisions
            .iter()
            .filter(|d| **d == GateDecision::Proceed)
            .count();
        assert_eq!(proceeded, 1);
        assert!(decisions
            .iter()
            .all(|d| *d == GateDecision::Proceed || *d == locked(11)));
    }
}
