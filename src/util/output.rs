use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Local;
use tracing::warn;

use crate::error::{BackupkitError, Result};

#[derive(Debug)]
pub struct OutputLog {
    path: PathBuf,
    file: File,
}

impl OutputLog {
    pub fn open(path: &Path, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BackupkitError::message(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(path).map_err(|e| {
            BackupkitError::message(format!("open output log {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&self, message: &str) {
        let line = format!("{} {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        if let Err(err) = (&self.file).write_all(line.as_bytes()) {
            warn!("output log {} write failed: {}", self.path.display(), err);
        }
    }

    fn stdio(&self) -> Result<Stdio> {
        let file = self.file.try_clone().map_err(|e| {
            BackupkitError::message(format!("output log {}: {}", self.path.display(), e))
        })?;
        Ok(Stdio::from(file))
    }

    pub fn attach(&self, cmd: &mut Command) -> Result<()> {
        cmd.stdout(self.stdio()?).stderr(self.stdio()?);
        Ok(())
    }

    pub fn attach_stderr(&self, cmd: &mut Command) -> Result<()> {
        cmd.stderr(self.stdio()?);
        Ok(())
    }
}
