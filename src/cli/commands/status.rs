use std::io::{self, Write};

use anyhow::{Context, Result};

use crate::config::model::RuntimeConfig;
use crate::gate::admin::{status, GateStatus};
use crate::gate::GateSettings;

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

pub fn write_status(out: &mut impl Write, settings: &GateSettings, state: &GateStatus) -> Result<()> {
    writeln!(
        out,
        "lockfile:     {} ({})",
        settings.lock_dir.display(),
        if state.locked { "present" } else { "absent" }
    )?;
    writeln!(out, "disabled:     {}", yes_no(state.disabled))?;
    writeln!(out, "silenced:     {}", yes_no(state.silenced))?;
    writeln!(out, "alert sent:   {}", yes_no(state.alert_pending))?;
    match state.last_started {
        Some(when) => writeln!(out, "last started: {}", when.format("%Y-%m-%d %H:%M:%S"))?,
        None => writeln!(out, "last started: never")?,
    }
    Ok(())
}

pub fn print_status(cfg: &RuntimeConfig) -> Result<()> {
    let state = status(&cfg.gate);
    let mut out = io::stdout().lock();
    write_status(&mut out, &cfg.gate, &state).context("write status")
}
