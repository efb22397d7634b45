use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupkitError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Tunnel(TunnelError),
    #[error("illegal identifier {0:?}; use only letters, digits and '_'")]
    BadVariableName(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

/// Why a tunnel could not be established. The display text is used verbatim
/// in alerts, so a timeout and an early exit read differently to operators.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("could not start {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("{label} timed out after {seconds} seconds without accepting connections")]
    TimedOut { label: String, seconds: u64 },
    #[error("{label} exited with {status}")]
    Exited { label: String, status: ChildStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Code(i32),
    Signal(i32),
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildStatus::Code(code) => write!(f, "status code {}", code),
            ChildStatus::Signal(sig) => write!(f, "signal {}", sig),
        }
    }
}

impl From<std::process::ExitStatus> for ChildStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ChildStatus::Code(code),
            (None, Some(sig)) => ChildStatus::Signal(sig),
            (None, None) => ChildStatus::Code(1),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupkitError>;

impl BackupkitError {
    pub fn message(msg: impl Into<String>) -> Self {
        BackupkitError::Message(msg.into())
    }
}

impl From<ConfigError> for BackupkitError {
    fn from(err: ConfigError) -> Self {
        BackupkitError::Config(err)
    }
}

impl From<TunnelError> for BackupkitError {
    fn from(err: TunnelError) -> Self {
        BackupkitError::Tunnel(err)
    }
}
