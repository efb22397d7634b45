use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::alert::AlertChannel;
use crate::cli::args::{Cli, Command};
use crate::cli::commands::{exit_for_error, run, status};
use crate::config::load::load_config;
use crate::gate::admin;
use crate::types::{ExitCodes, RunMode};

const CONFIG_FILE: &str = "/etc/backupkit.yaml";

pub mod args;
pub mod commands;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let run_mode = RunMode {
        dry_run: cli.dry_run,
        verbose: cli.verbose,
        quiet: cli.quiet,
    };
    let cfg = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => exit_for_error(&err, &ExitCodes::default()),
    };
    let mut alert_settings = cfg.alerts.clone();
    alert_settings.quiet |= run_mode.quiet;
    let alerts = AlertChannel::new(alert_settings);

    let command = cli.command.unwrap_or(Command::Run);
    let result = match command {
        Command::Run => run::run_backup(&cfg, &alerts, run_mode),
        Command::Rotate => run::run_rotate(&cfg, &alerts, run_mode),
        Command::Silence => admin::silence(&cfg.gate, &alerts),
        Command::Unsilence => admin::unsilence(&cfg.gate, &alerts),
        Command::Disable => admin::disable(&cfg.gate, &alerts),
        Command::Enable => admin::enable(&cfg.gate, &alerts),
        Command::ClearLock => admin::clear_lock(&cfg.gate, &alerts),
        Command::Status => return status::print_status(&cfg),
    };
    if let Err(err) = result {
        exit_for_error(&err, &cfg.exit_codes);
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
