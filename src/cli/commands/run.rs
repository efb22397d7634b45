use std::collections::BTreeSet;

use chrono::Local;
use tracing::{debug, warn};

use crate::alert::{AlertChannel, SyslogScope};
use crate::config::model::{
    DatabaseConfig, FamilySettings, PhaseConfig, RuntimeConfig, SyncModeConfig, TunnelConfig,
};
use crate::dbclient::DbClient;
use crate::error::{BackupkitError, Result};
use crate::exit::ExitCallbacks;
use crate::gate::{GateDecision, RunGate};
use crate::remote::RemoteShell;
use crate::rotate::{entry_names, rotate_family};
use crate::signal_handler::signal_handler;
use crate::supervise::{RemoteCommandHandle, Supervisor, TunnelHandle, TunnelSpec};
use crate::sync::{SyncCommand, SyncMode};
use crate::types::{Layout, RunMode, Slot};
use crate::util::output::OutputLog;
use crate::util::paths::is_safe_name;

pub fn run_backup(cfg: &RuntimeConfig, alerts: &AlertChannel, run_mode: RunMode) -> ! {
    let callbacks = ExitCallbacks::new();
    signal_handler(&callbacks);
    let code = execute(cfg, alerts, &callbacks, run_mode);
    callbacks.controlled_exit(code)
}

pub(crate) fn execute(
    cfg: &RuntimeConfig,
    alerts: &AlertChannel,
    callbacks: &ExitCallbacks,
    run_mode: RunMode,
) -> i32 {
    let codes = cfg.exit_codes;
    let gate = RunGate::new(cfg.gate.clone(), alerts.clone(), callbacks.clone());
    match gate.check_status("backup", "backups") {
        Ok(GateDecision::Proceed) => {}
        Ok(GateDecision::Abort { code, reason }) => {
            debug!(?reason, code, "run gate aborted");
            return code;
        }
        Err(err) => {
            alerts.log_alert(&format!("run gate failed: {}", err), SyslogScope::Normal);
            return codes.for_error(&err);
        }
    }

    let output = match open_output_log(cfg, run_mode) {
        Ok(output) => output,
        Err(err) => {
            alerts.send_alert(&format!("output log unavailable: {}", err), "", true);
            return codes.for_error(&err);
        }
    };
    let runner = PhaseRunner {
        cfg,
        alerts,
        supervisor: Supervisor::new(callbacks.clone(), alerts.clone(), codes, run_mode),
        shell: RemoteShell::new(cfg.ssh.clone()),
        output: output.as_ref(),
        run_mode,
    };

    runner.announce(&format!("{} started", cfg.name));
    let mut failed = Vec::new();
    for phase in &cfg.phases {
        if let Err(err) = runner.run_phase(phase) {
            runner.phase_failed(phase, &err);
            failed.push(phase.name.clone());
        }
    }
    if failed.is_empty() {
        runner.announce(&format!("{} finished", cfg.name));
        return codes.no_error;
    }
    alerts.send_alert(
        &format!("{} finished with failed phases: {}", cfg.name, failed.join(", ")),
        &match &output {
            Some(output) => format!("See {} for details.", output.path().display()),
            None => String::new(),
        },
        true,
    );
    codes.phase_error
}

fn open_output_log(cfg: &RuntimeConfig, run_mode: RunMode) -> Result<Option<OutputLog>> {
    let Some(settings) = &cfg.output_log else {
        return Ok(None);
    };
    rotate_family(settings, run_mode)?;
    let path = settings
        .family()?
        .target_path(settings.layout, Local::now(), &settings.date_format);
    if run_mode.dry_run {
        println!("dry-run: output log {}", path.display());
        return Ok(None);
    }
    OutputLog::open(&path, settings.layout == Layout::Single).map(Some)
}

struct PhaseRunner<'a> {
    cfg: &'a RuntimeConfig,
    alerts: &'a AlertChannel,
    supervisor: Supervisor,
    shell: RemoteShell,
    output: Option<&'a OutputLog>,
    run_mode: RunMode,
}

impl PhaseRunner<'_> {
    fn announce(&self, message: &str) {
        match self.output {
            Some(output) => {
                output.line(message);
                self.alerts.log_status_quiet(message, SyslogScope::Normal);
            }
            None => self.alerts.log_status(message, SyslogScope::Normal),
        }
    }

    fn phase_failed(&self, phase: &PhaseConfig, err: &BackupkitError) {
        let message = format!("phase {} failed: {}", phase.name, err);
        if let Some(output) = self.output {
            output.line(&message);
        }
        match err {
            // The supervisor already alerted with the tunnel details.
            BackupkitError::Tunnel(_) => self.alerts.log_alert(
                &format!("phase {} skipped", phase.name),
                SyslogScope::Normal,
            ),
            _ => self.alerts.send_alert(&message, "", true),
        }
    }

    fn run_phase(&self, phase: &PhaseConfig) -> Result<()> {
        self.announce(&format!("phase {} started", phase.name));
        let mut tunnel = match &phase.tunnel {
            Some(name) => Some(self.open_tunnel(name)?),
            None => None,
        };
        let mut remote = match self.start_remote_command(phase) {
            Ok(remote) => remote,
            Err(err) => {
                if let Some(handle) = tunnel.as_mut() {
                    self.supervisor.close_tunnel(handle);
                }
                return Err(err);
            }
        };

        let result = self.phase_work(phase, tunnel.as_ref());

        if let Some(handle) = remote.as_mut() {
            self.supervisor.kill_remote_background(handle);
        }
        if let Some(handle) = tunnel.as_mut() {
            self.supervisor.close_tunnel(handle);
        }
        if result.is_ok() {
            self.announce(&format!("phase {} finished", phase.name));
        }
        result
    }

    fn tunnel_config(&self, name: &str) -> Result<&TunnelConfig> {
        self.cfg
            .tunnels
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| BackupkitError::message(format!("unknown tunnel {}", name)))
    }

    fn open_tunnel(&self, name: &str) -> Result<TunnelHandle> {
        let tunnel = self.tunnel_config(name)?;
        let mut command = self.shell.tunnel_command(
            &tunnel.host,
            tunnel.local_port,
            &tunnel.remote_host,
            tunnel.remote_port,
        );
        if let Some(output) = self.output {
            output.attach(&mut command)?;
        }
        let spec = TunnelSpec {
            label: tunnel
                .label
                .clone()
                .unwrap_or_else(|| format!("{} tunnel", tunnel.name)),
            slot: tunnel.name.parse()?,
            command,
            local_port: tunnel.local_port,
            timeout_seconds: tunnel.timeout,
            on_error: tunnel.on_error,
        };
        self.supervisor.open_tunnel(spec).map_err(BackupkitError::Tunnel)
    }

    fn start_remote_command(&self, phase: &PhaseConfig) -> Result<Option<RemoteCommandHandle>> {
        let Some(remote) = &phase.remote_command else {
            return Ok(None);
        };
        let slot: Slot = format!("remote_{}", phase.name.replace(['-', '.'], "_")).parse()?;
        let mut command = self.shell.command(&remote.host, None, &remote.command);
        if let Some(output) = self.output {
            output.attach(&mut command)?;
        }
        let handle = self.supervisor.run_remote_background(
            &format!("phase {} remote command", phase.name),
            slot,
            command,
        )?;
        Ok(Some(handle))
    }

    fn phase_work(&self, phase: &PhaseConfig, tunnel: Option<&TunnelHandle>) -> Result<()> {
        if let Some(sync) = &phase.sync {
            let mode = match sync.mode {
                SyncModeConfig::Local => SyncMode::Local,
                SyncModeConfig::Direct => SyncMode::Direct {
                    host: sync.host.clone().unwrap_or_default(),
                },
                SyncModeConfig::Tunneled => SyncMode::Tunneled {
                    port: tunnel.map(TunnelHandle::local_port).ok_or_else(|| {
                        BackupkitError::message(format!(
                            "phase {}: tunneled sync without a tunnel",
                            phase.name
                        ))
                    })?,
                },
            };
            let mut command = SyncCommand::new(sync.source.clone(), sync.dest.clone(), mode);
            command.options = sync.options.clone();
            command.excludes = sync.excludes.clone();
            command.run(&self.shell, self.output, self.run_mode)?;
        }
        if let Some(databases) = &phase.databases {
            self.dump_databases(phase, databases, tunnel)?;
        }
        Ok(())
    }

    fn dump_databases(
        &self,
        phase: &PhaseConfig,
        databases: &DatabaseConfig,
        tunnel: Option<&TunnelHandle>,
    ) -> Result<()> {
        let mut client = DbClient::from_config(databases);
        if let Some(tunnel) = tunnel {
            client.host = Some("127.0.0.1".to_string());
            client.port = Some(tunnel.local_port());
        }
        let names = client.list_databases(self.run_mode)?;
        let mut failures = 0;
        let mut dumped = 0;
        for name in names {
            if databases.exclude.contains(&name) {
                debug!(database = %name, "excluded");
                continue;
            }
            if !is_safe_name(&name) {
                warn!(database = %name, "database name is not usable as a file name; skipped");
                continue;
            }
            let settings = databases.family_for(&name);
            if let Err(err) = self.dump_one(&client, databases, &name, &settings) {
                self.alerts.log_alert(
                    &format!("phase {}: database {}: {}", phase.name, name, err),
                    SyslogScope::Normal,
                );
                failures += 1;
            } else {
                dumped += 1;
            }
        }
        if failures > 0 {
            return Err(BackupkitError::message(format!(
                "{} of {} database dumps failed",
                failures,
                failures + dumped
            )));
        }
        Ok(())
    }

    fn dump_one(
        &self,
        client: &DbClient,
        databases: &DatabaseConfig,
        name: &str,
        settings: &FamilySettings,
    ) -> Result<()> {
        rotate_family(settings, self.run_mode)?;
        let target = settings
            .family()?
            .target_path(settings.layout, Local::now(), &settings.date_format);
        client.dump_to(
            name,
            &databases.dump_options,
            &target,
            self.output,
            self.run_mode,
        )
    }
}

fn dump_database<'a>(databases: &DatabaseConfig, name: &'a str) -> Option<&'a str> {
    let stem = name.strip_suffix(databases.suffix.as_str())?;
    let separator = databases.separator.as_str();
    let database = match databases.layout {
        Layout::Date if !separator.is_empty() => stem.split_once(separator)?.0,
        _ => {
            let numbered = !separator.is_empty()
                && stem.rsplit_once(separator).is_some_and(|(_, tail)| {
                    !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit())
                });
            if numbered {
                return None;
            }
            stem
        }
    };
    (!database.is_empty() && is_safe_name(database)).then_some(database)
}

fn dump_families(databases: &DatabaseConfig) -> Result<Vec<FamilySettings>> {
    let names = entry_names(&databases.dump_dir)?;
    let databases_found: BTreeSet<&str> = names
        .iter()
        .filter_map(|name| dump_database(databases, name))
        .collect();
    Ok(databases_found
        .into_iter()
        .map(|db| databases.family_for(db))
        .collect())
}

pub fn run_rotate(cfg: &RuntimeConfig, alerts: &AlertChannel, run_mode: RunMode) -> ! {
    let callbacks = ExitCallbacks::new();
    signal_handler(&callbacks);
    let code = rotate_artifacts(cfg, alerts, &callbacks, run_mode);
    callbacks.controlled_exit(code)
}

/// Holds the lockfile while rotating so a running backup never has its
/// output log moved away underneath it.
pub(crate) fn rotate_artifacts(
    cfg: &RuntimeConfig,
    alerts: &AlertChannel,
    callbacks: &ExitCallbacks,
    run_mode: RunMode,
) -> i32 {
    let codes = cfg.exit_codes;
    let gate = RunGate::new(cfg.gate.clone(), alerts.clone(), callbacks.clone());
    match gate.acquire("rotation", "rotations") {
        Ok(GateDecision::Proceed) => {}
        Ok(GateDecision::Abort { code, reason }) => {
            debug!(?reason, code, "rotation aborted");
            return code;
        }
        Err(err) => {
            alerts.log_alert(&format!("run gate failed: {}", err), SyslogScope::Normal);
            return codes.for_error(&err);
        }
    }
    match rotate_all(cfg, run_mode) {
        Ok(()) => codes.no_error,
        Err(err) => {
            alerts.log_alert(&format!("rotation failed: {}", err), SyslogScope::Normal);
            codes.for_error(&err)
        }
    }
}

fn rotate_all(cfg: &RuntimeConfig, run_mode: RunMode) -> Result<()> {
    if let Some(settings) = &cfg.output_log {
        rotate_family(settings, run_mode)?;
    }
    for phase in &cfg.phases {
        if let Some(databases) = &phase.databases {
            for settings in dump_families(databases)? {
                rotate_family(&settings, run_mode)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::recording_channel;
    use crate::config::load::parse_config;
    use std::fs;
    use std::net::TcpListener;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path, body: &str) -> RuntimeConfig {
        let yaml = format!(
            "lockfile: \"{}\"\n{}",
            dir.join("run/lockfile").display(),
            body
        );
        parse_config(&yaml).expect("config")
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[test]
    fn held_lock_aborts_with_lockfile_error() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(dir.path(), "");
        fs::create_dir_all(&cfg.gate.lock_dir).expect("mkdir");
        let (alerts, mailer, _syslog) = recording_channel(None);
        let callbacks = ExitCallbacks::new();
        assert_eq!(execute(&cfg, &alerts, &callbacks, RunMode::default()), 11);
        assert_eq!(mailer.count(), 1);
        assert!(callbacks.is_empty());
    }

    #[test]
    fn run_rotates_output_log_and_releases_lock() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("log/output.log");
        let cfg = config(
            dir.path(),
            &format!("outputLog:\n  path: \"{}\"\n  maxCount: 5\n", log.display()),
        );
        fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
        fs::write(&log, "previous run\n").expect("write");
        let (alerts, mailer, _syslog) = recording_channel(None);
        let callbacks = ExitCallbacks::new();

        assert_eq!(execute(&cfg, &alerts, &callbacks, RunMode::default()), 0);
        assert!(cfg.gate.lock_dir.is_dir());
        assert_eq!(callbacks.finish(0), 0);
        assert!(!cfg.gate.lock_dir.exists());

        let rotated = fs::read_to_string(dir.path().join("log/output.log.1")).expect("rotated");
        assert_eq!(rotated, "previous run\n");
        let current = fs::read_to_string(&log).expect("current");
        assert!(current.contains("backupkit started"));
        assert!(current.contains("backupkit finished"));
        assert_eq!(mailer.count(), 0);
    }

    #[test]
    fn failed_tunnel_skips_only_its_phase() {
        let dir = TempDir::new().expect("tempdir");
        let body = format!(
            r#"
ssh:
  program: "false"
tunnels:
  - name: "rsync_tunnel"
    host: "files.example.com"
    localPort: {}
    remotePort: 873
    timeout: 5
    onError: abortPhase
phases:
  - name: "home"
    tunnel: "rsync_tunnel"
    sync:
      source: "home/"
      dest: "{}"
      mode: tunneled
  - name: "snapshot"
    remoteCommand:
      host: "files.example.com"
      command: ["true"]
"#,
            free_port(),
            dir.path().join("dest").display()
        );
        let cfg = config(dir.path(), &body);
        let (alerts, mailer, _syslog) = recording_channel(None);
        let callbacks = ExitCallbacks::new();

        assert_eq!(execute(&cfg, &alerts, &callbacks, RunMode::default()), 30);
        let subjects = mailer.subjects();
        assert_eq!(subjects.len(), 2, "{:?}", subjects);
        assert!(subjects[0].contains("exited with status code 1"));
        assert!(subjects[1].contains("failed phases: home"));
        assert!(!subjects[1].contains("snapshot"));
        // Only the lock removal is left; the tunnel and remote command were released.
        assert_eq!(callbacks.len(), 1);
        callbacks.finish(0);
        assert!(!cfg.gate.lock_dir.exists());
    }

    #[test]
    fn rotate_command_shifts_existing_dumps() {
        let dir = TempDir::new().expect("tempdir");
        let dumps = dir.path().join("dumps");
        let cfg = config(
            dir.path(),
            &format!(
                "phases:\n  - name: \"mysql\"\n    databases:\n      dbms: mysql\n      dumpDir: \"{}\"\n",
                dumps.display()
            ),
        );
        fs::create_dir_all(&dumps).expect("mkdir");
        fs::write(dumps.join("shop.sql"), "dump").expect("write");
        fs::write(dumps.join("shop.1.sql"), "older").expect("write");
        let (alerts, _mailer, _syslog) = recording_channel(None);
        let callbacks = ExitCallbacks::new();
        assert_eq!(rotate_artifacts(&cfg, &alerts, &callbacks, RunMode::default()), 0);
        assert!(cfg.gate.lock_dir.is_dir());
        callbacks.finish(0);
        assert!(!cfg.gate.lock_dir.exists());
        assert!(!dumps.join("shop.sql").exists());
        assert_eq!(fs::read_to_string(dumps.join("shop.1.sql")).expect("read"), "dump");
        assert_eq!(fs::read_to_string(dumps.join("shop.2.sql")).expect("read"), "older");
        assert!(!dumps.join("shop.1.1.sql").exists());
    }

    #[test]
    fn rotate_command_waits_for_held_lock() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("log/output.log");
        let cfg = config(
            dir.path(),
            &format!("outputLog:\n  path: \"{}\"\n", log.display()),
        );
        fs::create_dir_all(&cfg.gate.lock_dir).expect("mkdir");
        fs::write(cfg.gate.disabled_marker(), "").expect("disable");
        fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
        fs::write(&log, "in use\n").expect("write");
        let (alerts, mailer, _syslog) = recording_channel(None);
        let callbacks = ExitCallbacks::new();

        assert_eq!(rotate_artifacts(&cfg, &alerts, &callbacks, RunMode::default()), 11);
        assert!(callbacks.is_empty());
        assert_eq!(mailer.count(), 1);
        assert_eq!(fs::read_to_string(&log).expect("read"), "in use\n");
        assert!(!dir.path().join("log/output.log.1").exists());
        assert!(cfg.gate.lock_dir.is_dir());
    }
}
