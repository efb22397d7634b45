use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config::model::{DatabaseConfig, Dbms};
use crate::error::{BackupkitError, Result};
use crate::types::RunMode;
use crate::util::command::{maybe_print_command, run_capture};
use crate::util::output::OutputLog;

const POSTGRES_LIST: &str = "COPY (SELECT datname FROM pg_database \
     WHERE datallowconn AND NOT datistemplate ORDER BY datname) TO STDOUT";
const MYSQL_LIST: &str = "SHOW DATABASES";

/// Undo the backslash escaping a client applies to one line of tabular
/// output.
///
/// MySQL batch mode escapes `\\`, newline, tab and NUL. PostgreSQL COPY text
/// additionally escapes carriage return, backspace, form feed, vertical tab
/// and arbitrary bytes as octal `\NNN`. An unknown escape stands for the
/// character itself.
pub fn unescape(dbms: Dbms, line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match (dbms, next) {
            (_, '\\') => out.push('\\'),
            (_, 'n') => out.push('\n'),
            (_, 't') => out.push('\t'),
            (Dbms::Mysql, '0') => out.push('\0'),
            (Dbms::Postgres, 'r') => out.push('\r'),
            (Dbms::Postgres, 'b') => out.push('\u{8}'),
            (Dbms::Postgres, 'f') => out.push('\u{c}'),
            (Dbms::Postgres, 'v') => out.push('\u{b}'),
            (Dbms::Postgres, d @ '0'..='7') => {
                let mut value = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value & 0xff).unwrap_or('\u{fffd}'));
            }
            (_, other) => out.push(other),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct DbClient {
    pub dbms: Dbms,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub credentials_file: Option<PathBuf>,
}

impl DbClient {
    pub fn from_config(cfg: &DatabaseConfig) -> Self {
        Self {
            dbms: cfg.dbms,
            host: cfg.host.clone(),
            port: cfg.port,
            user: cfg.user.clone(),
            credentials_file: cfg.credentials_file.clone(),
        }
    }

    fn base(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        match self.dbms {
            Dbms::Mysql => {
                // mysql only honours --defaults-extra-file as the first option.
                if let Some(file) = &self.credentials_file {
                    cmd.arg(format!("--defaults-extra-file={}", file.display()));
                }
                if let Some(host) = &self.host {
                    cmd.arg("-h").arg(host);
                }
                if let Some(port) = self.port {
                    cmd.arg("-P").arg(port.to_string());
                }
                if let Some(user) = &self.user {
                    cmd.arg("-u").arg(user);
                }
            }
            Dbms::Postgres => {
                if let Some(file) = &self.credentials_file {
                    cmd.env("PGPASSFILE", file);
                }
                if let Some(host) = &self.host {
                    cmd.arg("-h").arg(host);
                }
                if let Some(port) = self.port {
                    cmd.arg("-p").arg(port.to_string());
                }
                if let Some(user) = &self.user {
                    cmd.arg("-U").arg(user);
                }
            }
        }
        cmd
    }

    pub fn statement_command(&self, statement: &str) -> Command {
        match self.dbms {
            Dbms::Mysql => {
                let mut cmd = self.base("mysql");
                cmd.arg("--batch")
                    .arg("--skip-column-names")
                    .arg("-e")
                    .arg(statement);
                cmd
            }
            Dbms::Postgres => {
                let mut cmd = self.base("psql");
                cmd.arg("-X")
                    .arg("-q")
                    .arg("-d")
                    .arg("postgres")
                    .arg("-c")
                    .arg(statement);
                cmd
            }
        }
    }

    pub fn list_command(&self) -> Command {
        match self.dbms {
            Dbms::Mysql => self.statement_command(MYSQL_LIST),
            Dbms::Postgres => self.statement_command(POSTGRES_LIST),
        }
    }

    pub fn list_databases(&self, run_mode: RunMode) -> Result<Vec<String>> {
        let read_mode = RunMode {
            dry_run: false,
            ..run_mode
        };
        let output = run_capture(&mut self.list_command(), read_mode)?;
        if output.code != 0 {
            return Err(BackupkitError::message(format!(
                "listing {} databases failed with exit code {}",
                self.dbms_name(),
                output.code
            )));
        }
        Ok(output
            .stdout
            .lines()
            .map(|line| unescape(self.dbms, line))
            .filter(|name| !name.is_empty())
            .collect())
    }

    pub fn dump_command(&self, database: &str, options: &[String]) -> Command {
        let mut cmd = match self.dbms {
            Dbms::Mysql => self.base("mysqldump"),
            Dbms::Postgres => self.base("pg_dump"),
        };
        cmd.args(options).arg(database);
        cmd
    }

    pub fn dump_to(
        &self,
        database: &str,
        options: &[String],
        path: &Path,
        output: Option<&OutputLog>,
        run_mode: RunMode,
    ) -> Result<()> {
        let mut cmd = self.dump_command(database, options);
        if let Some(output) = output {
            output.attach_stderr(&mut cmd)?;
        }
        maybe_print_command(&cmd, run_mode);
        if run_mode.dry_run {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BackupkitError::message(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let file = File::create(path)
            .map_err(|e| BackupkitError::message(format!("create {}: {}", path.display(), e)))?;
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .status()
            .map_err(|e| {
                BackupkitError::message(format!("{}: {}", cmd.get_program().to_string_lossy(), e))
            });
        let code = match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(err) => {
                let _ = fs::remove_file(path);
                return Err(err);
            }
        };
        if code != 0 {
            let _ = fs::remove_file(path);
            return Err(BackupkitError::message(format!(
                "dump of {} database {} failed with exit code {}",
                self.dbms_name(),
                database,
                code
            )));
        }
        debug!(database, path = %path.display(), "dumped");
        Ok(())
    }

    fn dbms_name(&self) -> &'static str {
        match self.dbms {
            Dbms::Mysql => "mysql",
            Dbms::Postgres => "postgres",
        }
    }
}
