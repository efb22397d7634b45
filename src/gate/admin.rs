use std::fs;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::alert::{AlertChannel, SyslogScope};
use crate::error::{BackupkitError, Result};
use crate::gate::GateSettings;
use crate::util::paths::{remove_file_if_exists, remove_path, touch};

pub fn silence(settings: &GateSettings, alerts: &AlertChannel) -> Result<()> {
    if !settings.lock_dir.is_dir() {
        return Err(BackupkitError::message(format!(
            "lockfile {} does not exist; there are no alerts to silence",
            settings.lock_dir.display()
        )));
    }
    touch(&settings.silenced_marker())?;
    alerts.log_status(
        &format!(
            "lockfile alerts silenced until {} is removed",
            settings.lock_dir.display()
        ),
        SyslogScope::Normal,
    );
    Ok(())
}

pub fn unsilence(settings: &GateSettings, alerts: &AlertChannel) -> Result<()> {
    let message = if remove_file_if_exists(&settings.silenced_marker())? {
        "lockfile alerts unsilenced"
    } else {
        "lockfile alerts were not silenced"
    };
    alerts.log_status(message, SyslogScope::Normal);
    Ok(())
}

pub fn disable(settings: &GateSettings, alerts: &AlertChannel) -> Result<()> {
    fs::create_dir_all(&settings.lock_dir).map_err(|e| {
        BackupkitError::message(format!(
            "create lockfile {}: {}",
            settings.lock_dir.display(),
            e
        ))
    })?;
    touch(&settings.disabled_marker())?;
    alerts.log_status(
        &format!(
            "{} disabled; run `enable` to re-enable",
            alerts.settings().name
        ),
        SyslogScope::Normal,
    );
    Ok(())
}

pub fn enable(settings: &GateSettings, alerts: &AlertChannel) -> Result<()> {
    if !settings.disabled_marker().exists() {
        alerts.log_status(
            &format!("{} is not disabled", alerts.settings().name),
            SyslogScope::Normal,
        );
        return Ok(());
    }
    remove_path(&settings.lock_dir)?;
    alerts.log_status(
        &format!("{} enabled", alerts.settings().name),
        SyslogScope::Normal,
    );
    Ok(())
}

pub fn clear_lock(settings: &GateSettings, alerts: &AlertChannel) -> Result<()> {
    let had_lock = settings.lock_dir.exists();
    remove_path(&settings.lock_dir)?;
    remove_file_if_exists(&settings.alert_file)?;
    let message = if had_lock {
        format!("lockfile {} removed", settings.lock_dir.display())
    } else {
        format!("lockfile {} was not present", settings.lock_dir.display())
    };
    alerts.log_status(&message, SyslogScope::Normal);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStatus {
    pub locked: bool,
    pub disabled: bool,
    pub silenced: bool,
    pub alert_pending: bool,
    pub last_started: Option<DateTime<Local>>,
}

fn modified(path: &std::path::Path) -> Option<DateTime<Local>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|t: SystemTime| DateTime::<Local>::from(t))
}

pub fn status(settings: &GateSettings) -> GateStatus {
    GateStatus {
        locked: settings.lock_dir.is_dir(),
        disabled: settings.disabled_marker().exists(),
        silenced: settings.silenced_marker().exists(),
        alert_pending: settings.alert_file.exists(),
        last_started: modified(&settings.started_file),
    }
}
