use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::rotate::Family;
use crate::types::{ExitCodes, Layout, OnError};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_name")]
    pub name: String,
    pub lockfile: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_file: Option<PathBuf>,
    /// Minimum minutes between runs; 0 disables the check.
    #[serde(default)]
    pub run_every: u64,
    #[serde(default = "default_alert_interval")]
    pub alert_interval: u64,
    #[serde(default)]
    pub no_email_on_repeat: bool,
    #[serde(default)]
    pub exit_codes: ExitCodes,
    #[serde(default)]
    pub alerts: AlertOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log: Option<FamilySettings>,
    #[serde(default)]
    pub ssh: SshOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyslogPolicy {
    #[default]
    Off,
    On,
    All,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertOptions {
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub syslog: SyslogPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_log: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email: Vec<String>,
    #[serde(default)]
    pub no_email: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailer: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FamilySettings {
    pub path: PathBuf,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub max_count: u64,
    #[serde(default)]
    pub max_days: u64,
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

impl FamilySettings {
    pub fn family(&self) -> Result<Family> {
        Family::from_template(&self.path, &self.separator, &self.suffix).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "rotation path {} has no file name",
                self.path.display()
            ))
            .into()
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SshOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub host: String,
    pub local_port: u16,
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default = "default_tunnel_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PhaseConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_command: Option<RemoteCommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<DatabaseConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandConfig {
    pub host: String,
    pub command: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncModeConfig {
    #[default]
    Local,
    Direct,
    Tunneled,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub source: String,
    pub dest: PathBuf,
    #[serde(default)]
    pub mode: SyncModeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Dbms {
    Mysql,
    Postgres,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub dbms: Dbms,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    pub dump_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dump_options: Vec<String>,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_dump_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub max_count: u64,
    #[serde(default)]
    pub max_days: u64,
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

impl DatabaseConfig {
    pub fn family_for(&self, database: &str) -> FamilySettings {
        FamilySettings {
            path: self.dump_dir.join(database),
            layout: self.layout,
            separator: self.separator.clone(),
            suffix: self.suffix.clone(),
            max_count: self.max_count,
            max_days: self.max_days,
            date_format: self.date_format.clone(),
        }
    }
}

fn default_name() -> String {
    "backupkit".to_string()
}

fn default_alert_interval() -> u64 {
    24 * 60
}

fn default_separator() -> String {
    ".".to_string()
}

fn default_date_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_dump_suffix() -> String {
    ".sql".to_string()
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_tunnel_timeout() -> u64 {
    30
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub name: String,
    pub gate: crate::gate::GateSettings,
    pub alerts: crate::alert::AlertSettings,
    pub ssh: crate::remote::SshSettings,
    pub exit_codes: ExitCodes,
    pub output_log: Option<FamilySettings>,
    pub tunnels: Vec<TunnelConfig>,
    pub phases: Vec<PhaseConfig>,
}
