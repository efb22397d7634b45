use std::process::{Command, Stdio};

use crate::error::{BackupkitError, Result};
use crate::types::RunMode;

pub fn describe_command(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    let args: Vec<String> = cmd
        .get_args()
        .map(|a| a.to_string_lossy().to_string())
        .collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

pub fn maybe_print_command(cmd: &Command, run_mode: RunMode) {
    if !run_mode.dry_run && !run_mode.verbose {
        return;
    }
    println!("{}", describe_command(cmd));
}

pub fn run_command(cmd: &mut Command, run_mode: RunMode) -> Result<i32> {
    maybe_print_command(cmd, run_mode);
    if run_mode.dry_run {
        return Ok(0);
    }
    let status = cmd.status().map_err(|e| {
        BackupkitError::message(format!("{}: {}", cmd.get_program().to_string_lossy(), e))
    })?;
    Ok(status.code().unwrap_or(1))
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub code: i32,
    pub stdout: String,
}

pub fn run_capture(cmd: &mut Command, run_mode: RunMode) -> Result<CapturedOutput> {
    maybe_print_command(cmd, run_mode);
    let output = cmd
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| {
            BackupkitError::message(format!("{}: {}", cmd.get_program().to_string_lossy(), e))
        })?;
    Ok(CapturedOutput {
        code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
    })
}

pub fn nice_ionice(args: &[String]) -> Command {
    let mut cmd = Command::new("nice");
    cmd.arg("-n")
        .arg("19")
        .arg("ionice")
        .arg("-c")
        .arg("3")
        .arg("-n7");
    for arg in args {
        cmd.arg(arg);
    }
    cmd
}
