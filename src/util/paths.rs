use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{BackupkitError, Result};

pub fn is_safe_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Time since `path` was last modified. Symlinks are not followed. A
/// modification time in the future counts as zero age.
pub fn age_of(path: &Path) -> io::Result<Duration> {
    let modified = fs::symlink_metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

pub fn is_younger_than(path: &Path, limit: Duration) -> io::Result<bool> {
    match age_of(path) {
        Ok(age) => Ok(age < limit),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn touch(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BackupkitError::message(format!("touch {}: {}", path.display(), e)))?;
    file.set_modified(SystemTime::now())
        .map_err(|e| BackupkitError::message(format!("touch {}: {}", path.display(), e)))?;
    Ok(())
}

pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn age_is_measured_from_mtime() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("stamp");
        let file = File::create(&path).expect("create");
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .expect("set mtime");
        assert!(!is_younger_than(&path, Duration::from_secs(60)).expect("age"));
        assert!(is_younger_than(&path, Duration::from_secs(7200)).expect("age"));
    }

    #[test]
    fn missing_file_is_never_younger() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("missing");
        assert!(!is_younger_than(&path, Duration::from_secs(60)).expect("age"));
    }

    #[test]
    fn touch_refreshes_mtime() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("stamp");
        let file = File::create(&path).expect("create");
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .expect("set mtime");
        touch(&path).expect("touch");
        assert!(age_of(&path).expect("age") < Duration::from_secs(60));
    }

    #[test]
    fn remove_path_handles_dirs_and_missing() {
        let dir = TempDir::new().expect("tempdir");
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("nested")).expect("mkdir");
        File::create(tree.join("nested/file")).expect("create");
        remove_path(&tree).expect("remove");
        assert!(!tree.exists());
        remove_path(&tree).expect("remove missing");
    }
}
