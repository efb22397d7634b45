use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::alert::AlertSettings;
use crate::config::model::{Config, FamilySettings, RuntimeConfig, SyncModeConfig};
use crate::error::{BackupkitError, ConfigError, Result};
use crate::gate::GateSettings;
use crate::remote::SshSettings;
use crate::types::{Layout, Slot};
use crate::util::paths::is_safe_name;

const DEFAULT_SSH_PROGRAM: &str = "ssh";
const STARTED_FILE: &str = "startedfile";
const ALERT_FILE: &str = "alertfile";

pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let mut contents = String::new();
    File::open(path)
        .map_err(|e| BackupkitError::message(format!("open config {}: {}", path.display(), e)))?
        .read_to_string(&mut contents)
        .map_err(BackupkitError::Io)?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<RuntimeConfig> {
    let cfg: Config =
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    parse_runtime(cfg)
}

fn sibling(lockfile: &Path, name: &str) -> PathBuf {
    match lockfile.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn validate_family(what: &str, family: &FamilySettings) -> Result<()> {
    if family.layout == Layout::Number && family.separator.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{}: number layout requires a separator",
            what
        ))
        .into());
    }
    family.family()?;
    Ok(())
}

fn parse_runtime(cfg: Config) -> Result<RuntimeConfig> {
    if !is_safe_name(&cfg.name) {
        return Err(ConfigError::Invalid(format!(
            "name {} must use only letters, digits, '.', '-', '_'",
            cfg.name
        ))
        .into());
    }
    if !cfg.lockfile.is_absolute() {
        return Err(ConfigError::Invalid(format!(
            "lockfile {} must be an absolute path",
            cfg.lockfile.display()
        ))
        .into());
    }
    if let Some(output_log) = &cfg.output_log {
        validate_family("outputLog", output_log)?;
    }

    let mut tunnel_names = HashSet::new();
    for tunnel in &cfg.tunnels {
        if tunnel.name.parse::<Slot>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "tunnel {} name must be an identifier (letters, digits, '_')",
                tunnel.name
            ))
            .into());
        }
        if !tunnel_names.insert(tunnel.name.clone()) {
            return Err(ConfigError::Invalid(format!("duplicate tunnel name {}", tunnel.name)).into());
        }
        if tunnel.local_port == 0 || tunnel.remote_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "tunnel {}: ports must be non-zero",
                tunnel.name
            ))
            .into());
        }
    }

    let mut phase_names = HashSet::new();
    for phase in &cfg.phases {
        if !is_safe_name(&phase.name) {
            return Err(ConfigError::Invalid(format!(
                "phase {} name must use only letters, digits, '.', '-', '_'",
                phase.name
            ))
            .into());
        }
        if !phase_names.insert(phase.name.clone()) {
            return Err(ConfigError::Invalid(format!("duplicate phase name {}", phase.name)).into());
        }
        if let Some(tunnel) = &phase.tunnel {
            if !tunnel_names.contains(tunnel) {
                return Err(ConfigError::Invalid(format!(
                    "phase {} uses unknown tunnel {}",
                    phase.name, tunnel
                ))
                .into());
            }
        }
        if phase.sync.is_none() && phase.databases.is_none() && phase.remote_command.is_none() {
            return Err(ConfigError::Invalid(format!("phase {} has nothing to do", phase.name)).into());
        }
        if let Some(sync) = &phase.sync {
            if sync.source.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "phase {}: sync source is empty",
                    phase.name
                ))
                .into());
            }
            match sync.mode {
                SyncModeConfig::Tunneled if phase.tunnel.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "phase {}: tunneled sync requires a tunnel",
                        phase.name
                    ))
                    .into());
                }
                SyncModeConfig::Direct if sync.host.is_none() => {
                    return Err(ConfigError::Invalid(format!(
                        "phase {}: direct sync requires a host",
                        phase.name
                    ))
                    .into());
                }
                _ => {}
            }
        }
        if let Some(databases) = &phase.databases {
            validate_family(
                &format!("phase {}", phase.name),
                &databases.family_for("database"),
            )?;
        }
    }

    let started_file = cfg
        .started_file
        .clone()
        .unwrap_or_else(|| sibling(&cfg.lockfile, STARTED_FILE));
    let alert_file = cfg
        .alert_file
        .clone()
        .unwrap_or_else(|| sibling(&cfg.lockfile, ALERT_FILE));

    Ok(RuntimeConfig {
        gate: GateSettings {
            lock_dir: cfg.lockfile.clone(),
            started_file,
            alert_file,
            run_every_minutes: cfg.run_every,
            alert_interval_minutes: cfg.alert_interval,
            no_email_on_repeat: cfg.no_email_on_repeat,
            exit_codes: cfg.exit_codes,
        },
        alerts: AlertSettings {
            name: cfg.name.clone(),
            quiet: cfg.alerts.quiet,
            syslog: cfg.alerts.syslog,
            syslog_facility: cfg
                .alerts
                .syslog_facility
                .clone()
                .unwrap_or_else(|| "user".to_string()),
            status_log: cfg.alerts.status_log.clone(),
            email: cfg.alerts.email.clone(),
            no_email: cfg.alerts.no_email,
            mailer: cfg.alerts.mailer.clone(),
        },
        ssh: SshSettings {
            program: cfg
                .ssh
                .program
                .clone()
                .unwrap_or_else(|| DEFAULT_SSH_PROGRAM.to_string()),
            options: cfg.ssh.options.clone(),
        },
        exit_codes: cfg.exit_codes,
        name: cfg.name,
        output_log: cfg.output_log,
        tunnels: cfg.tunnels,
        phases: cfg.phases,
    })
}
