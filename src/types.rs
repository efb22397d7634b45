use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BackupkitError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot(String);

impl Slot {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Slot {
    type Err = BackupkitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let valid = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if !valid {
            return Err(BackupkitError::BadVariableName(s.to_string()));
        }
        Ok(Slot(s.to_string()))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunMode {
    pub dry_run: bool,
    pub verbose: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExitCodes {
    pub no_error: i32,
    pub startup_error: i32,
    pub lockfile_error: i32,
    pub bad_variable_name: i32,
    pub no_delimiter_found: i32,
    pub ssh_tunnel_error: i32,
    pub phase_error: i32,
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self {
            no_error: 0,
            startup_error: 1,
            lockfile_error: 11,
            bad_variable_name: 201,
            no_delimiter_found: 202,
            ssh_tunnel_error: 20,
            phase_error: 30,
        }
    }
}

impl ExitCodes {
    pub fn for_error(&self, err: &BackupkitError) -> i32 {
        match err {
            BackupkitError::BadVariableName(_) => self.bad_variable_name,
            BackupkitError::Tunnel(_) => self.ssh_tunnel_error,
            _ => self.startup_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OnError {
    #[default]
    Exit,
    AbortPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Single,
    #[default]
    Number,
    Date,
    Append,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Single => "single",
            Layout::Number => "number",
            Layout::Date => "date",
            Layout::Append => "append",
        }
    }
}
