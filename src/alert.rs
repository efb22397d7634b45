use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::Local;
use tracing::warn;

use crate::config::model::SyslogPolicy;
use crate::error::{BackupkitError, Result};

const DEFAULT_MAILER: &str = "mailx";
const LOGGER: &str = "logger";

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub name: String,
    pub quiet: bool,
    pub syslog: SyslogPolicy,
    pub syslog_facility: String,
    pub status_log: Option<PathBuf>,
    pub email: Vec<String>,
    pub no_email: bool,
    pub mailer: Option<String>,
}

impl AlertSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quiet: false,
            syslog: SyslogPolicy::Off,
            syslog_facility: "user".to_string(),
            status_log: None,
            email: Vec::new(),
            no_email: false,
            mailer: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyslogScope {
    Normal,
    AllOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Info,
    Err,
}

impl Priority {
    fn as_str(&self) -> &'static str {
        match self {
            Priority::Info => "info",
            Priority::Err => "err",
        }
    }
}

pub trait Mailer: Send + Sync {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()>;
}

pub trait SyslogSink: Send + Sync {
    fn log(&self, tag: &str, facility: &str, priority: Priority, message: &str) -> Result<()>;
}

pub struct CommandMailer {
    program: String,
}

impl CommandMailer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Mailer for CommandMailer {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-s")
            .arg(subject)
            .args(recipients)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| BackupkitError::message(format!("{}: {}", self.program, e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(BackupkitError::message(format!(
                "{} failed with exit code {}",
                self.program,
                status.code().unwrap_or(1)
            )));
        }
        Ok(())
    }
}

pub struct LoggerSyslog;

impl SyslogSink for LoggerSyslog {
    fn log(&self, tag: &str, facility: &str, priority: Priority, message: &str) -> Result<()> {
        let status = Command::new(LOGGER)
            .arg("-t")
            .arg(tag)
            .arg("-p")
            .arg(format!("{}.{}", facility, priority.as_str()))
            .arg("--")
            .arg(message)
            .status()
            .map_err(|e| BackupkitError::message(format!("{}: {}", LOGGER, e)))?;
        if !status.success() {
            return Err(BackupkitError::message(format!(
                "{} failed with exit code {}",
                LOGGER,
                status.code().unwrap_or(1)
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct AlertChannel {
    settings: Arc<AlertSettings>,
    mailer: Arc<dyn Mailer>,
    syslog: Arc<dyn SyslogSink>,
    host: String,
}

impl AlertChannel {
    pub fn new(settings: AlertSettings) -> Self {
        let mailer = CommandMailer::new(
            settings
                .mailer
                .clone()
                .unwrap_or_else(|| DEFAULT_MAILER.to_string()),
        );
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            settings: Arc::new(settings),
            mailer: Arc::new(mailer),
            syslog: Arc::new(LoggerSyslog),
            host,
        }
    }

    pub fn with_mailer(mut self, mailer: impl Mailer + 'static) -> Self {
        self.mailer = Arc::new(mailer);
        self
    }

    pub fn with_syslog(mut self, syslog: impl SyslogSink + 'static) -> Self {
        self.syslog = Arc::new(syslog);
        self
    }

    pub fn settings(&self) -> &AlertSettings {
        &self.settings
    }

    fn to_syslog(&self, priority: Priority, message: &str, scope: SyslogScope) {
        let wanted = match self.settings.syslog {
            SyslogPolicy::Off => false,
            SyslogPolicy::On => scope == SyslogScope::Normal,
            SyslogPolicy::All => true,
        };
        if !wanted {
            return;
        }
        if let Err(err) = self.syslog.log(
            &self.settings.name,
            &self.settings.syslog_facility,
            priority,
            message,
        ) {
            warn!("syslog write failed: {}", err);
        }
    }

    fn to_status_log(&self, message: &str) {
        let Some(path) = &self.settings.status_log else {
            return;
        };
        let line = format!(
            "{} {}[{}]: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.settings.name,
            std::process::id(),
            message
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(err) = result {
            warn!("status log {} write failed: {}", path.display(), err);
        }
    }

    fn emit(&self, priority: Priority, message: &str, scope: SyslogScope, terminal: bool) {
        self.to_syslog(priority, message, scope);
        if terminal {
            match priority {
                Priority::Info if !self.settings.quiet => println!("{}", message),
                Priority::Info => {}
                Priority::Err => eprintln!("{}", message),
            }
        }
        self.to_status_log(message);
    }

    pub fn log_status(&self, message: &str, scope: SyslogScope) {
        self.emit(Priority::Info, message, scope, true);
    }

    pub fn log_alert(&self, message: &str, scope: SyslogScope) {
        self.emit(Priority::Err, message, scope, true);
    }

    pub fn log_status_quiet(&self, message: &str, scope: SyslogScope) {
        self.emit(Priority::Info, message, scope, false);
    }

    pub fn log_alert_quiet(&self, message: &str, scope: SyslogScope) {
        self.emit(Priority::Err, message, scope, false);
    }

    fn email_enabled(&self) -> bool {
        !self.settings.no_email && !self.settings.email.is_empty()
    }

    pub fn send_alert(&self, message: &str, context: &str, log_also: bool) {
        if log_also {
            self.log_alert(message, SyslogScope::Normal);
        }
        if !self.email_enabled() {
            return;
        }
        let subject = format!("{} on {}: {}", self.settings.name, self.host, message);
        let mut body = format!("{}\n", message);
        if !context.is_empty() {
            body.push('\n');
            body.push_str(context);
            body.push('\n');
        }
        body.push_str(&format!(
            "\nhost: {}\nname: {}\npid: {}\ntime: {}\n",
            self.host,
            self.settings.name,
            std::process::id(),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        let recipients = self.settings.email.join(", ");
        match self.mailer.send(&subject, &body, &self.settings.email) {
            Ok(()) => self.log_status(
                &format!("alert email sent to {}", recipients),
                SyslogScope::AllOnly,
            ),
            Err(err) => self.log_alert(
                &format!("failed to send alert email to {}: {}", recipients, err),
                SyslogScope::Normal,
            ),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn send_alert_mails_and_confirms() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("status.log");
        let (channel, mailer, syslog) = recording_channel(Some(log.clone()));
        channel.send_alert("lockfile exists", "previous run still active", true);
        assert_eq!(mailer.count(), 1);
        let mail = mailer.sent.lock().unwrap()[0].clone();
        assert!(mail.subject.contains("lockfile exists"));
        assert!(mail.body.contains("previous run still active"));
        assert_eq!(mail.recipients, vec!["ops@example.com".to_string()]);
        let status = std::fs::read_to_string(&log).expect("read");
        assert!(status.contains("lockfile exists"));
        assert!(status.contains("alert email sent to ops@example.com"));
        let lines = syslog.lines.lock().unwrap().clone();
        assert_eq!(lines, vec![(Priority::Err, "lockfile exists".to_string())]);
    }

    #[test]
    fn suppressed_email_sends_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("status.log");
        let mut settings = AlertSettings::new("t");
        settings.quiet = true;
        settings.email = vec!["ops@example.com".to_string()];
        settings.no_email = true;
        settings.status_log = Some(log.clone());
        let mailer = RecordingMailer::default();
        let channel = AlertChannel::new(settings).with_mailer(mailer.clone());
        channel.send_alert("broken", "", false);
        assert_eq!(mailer.count(), 0);
        assert!(!log.exists());
    }

    #[test]
    fn all_only_messages_need_all_policy() {
        let (channel, _mailer, syslog) = recording_channel(None);
        channel.log_status("chatty", SyslogScope::AllOnly);
        channel.log_status_quiet("normal", SyslogScope::Normal);
        let lines = syslog.lines.lock().unwrap().clone();
        assert_eq!(lines, vec![(Priority::Info, "normal".to_string())]);
    }

    #[test]
    fn status_log_lines_are_tagged() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("status.log");
        let (channel, _mailer, _syslog) = recording_channel(Some(log.clone()));
        channel.log_alert_quiet("tunnel down", SyslogScope::Normal);
        let status = std::fs::read_to_string(&log).expect("read");
        let expected = format!("backupkit-test[{}]: tunnel down", std::process::id());
        assert!(status.trim_end().ends_with(&expected), "{}", status);
    }
}
