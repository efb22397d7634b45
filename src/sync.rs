use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{BackupkitError, Result};
use crate::remote::RemoteShell;
use crate::types::RunMode;
use crate::util::command::{nice_ionice, run_command};
use crate::util::output::OutputLog;

const MAX_ATTEMPTS: u32 = 3;
/// rsync's "some files vanished before they could be transferred".
const VANISHED_FILES: i32 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    Local,
    Direct { host: String },
    Tunneled { port: u16 },
}

#[derive(Debug, Clone)]
pub struct SyncCommand {
    pub source: String,
    pub dest: PathBuf,
    pub mode: SyncMode,
    pub options: Vec<String>,
    pub excludes: Vec<String>,
    program: Vec<String>,
    niced: bool,
    retry_delay: Duration,
}

impl SyncCommand {
    pub fn new(source: impl Into<String>, dest: impl Into<PathBuf>, mode: SyncMode) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode,
            options: Vec::new(),
            excludes: Vec::new(),
            program: vec!["rsync".to_string()],
            niced: true,
            retry_delay: Duration::from_secs(30),
        }
    }

    pub fn with_program(mut self, program: Vec<String>, niced: bool) -> Self {
        self.program = program;
        self.niced = niced;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn source_arg(&self) -> String {
        match &self.mode {
            SyncMode::Local => self.source.clone(),
            SyncMode::Direct { host } => format!("{}:{}", host, self.source),
            SyncMode::Tunneled { port } => format!(
                "rsync://localhost:{}/{}",
                port,
                self.source.trim_start_matches('/')
            ),
        }
    }

    pub fn args(&self, shell: &RemoteShell) -> Vec<String> {
        let mut args = self.program.clone();
        args.extend(["-a", "--stats", "--delete-after"].map(String::from));
        if let SyncMode::Direct { .. } = self.mode {
            args.push("-e".to_string());
            args.push(shell.transport());
        }
        for pattern in &self.excludes {
            args.push(format!("--exclude={}", pattern));
        }
        args.extend(self.options.iter().cloned());
        args.push(self.source_arg());
        args.push(self.dest.to_string_lossy().to_string());
        args
    }

    pub fn run(
        &self,
        shell: &RemoteShell,
        output: Option<&OutputLog>,
        run_mode: RunMode,
    ) -> Result<i32> {
        if !run_mode.dry_run {
            fs::create_dir_all(&self.dest).map_err(|e| {
                BackupkitError::message(format!("create {}: {}", self.dest.display(), e))
            })?;
        }
        let args = self.args(shell);
        let mut code = 0;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut cmd = if self.niced {
                nice_ionice(&args)
            } else {
                let mut cmd = std::process::Command::new(&args[0]);
                cmd.args(&args[1..]);
                cmd
            };
            if let Some(output) = output {
                output.attach(&mut cmd)?;
            }
            code = run_command(&mut cmd, run_mode)?;
            if code == 0 || code == VANISHED_FILES {
                return Ok(code);
            }
            warn!(
                source = %self.source,
                attempt,
                "{} failed with exit code {}",
                self.program.join(" "),
                code
            );
            if attempt < MAX_ATTEMPTS {
                thread::sleep(self.retry_delay);
            }
        }
        Err(BackupkitError::message(format!(
            "{} {} failed with exit code {} after {} attempts",
            self.program.join(" "),
            self.source_arg(),
            code,
            MAX_ATTEMPTS
        )))
    }
}
