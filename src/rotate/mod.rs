use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::model::FamilySettings;
use crate::error::{BackupkitError, Result};
use crate::types::{Layout, RunMode};
use crate::util::paths::{age_of, remove_path};

pub mod naming;

pub use naming::{Compression, Family, Member, Position};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

pub(crate) fn entry_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            BackupkitError::message(format!("read {}: {}", dir.display(), e))
        })?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

pub fn current_members(family: &Family) -> Result<Vec<Member>> {
    Ok(entry_names(&family.dir)?
        .into_iter()
        .filter_map(|name| {
            family.parse_current(&name).map(|compression| Member {
                path: family.dir.join(&name),
                position: Position::Current,
                compression,
            })
        })
        .collect())
}

pub fn numbered_members(family: &Family) -> Result<Vec<Member>> {
    let mut members: Vec<Member> = entry_names(&family.dir)?
        .into_iter()
        .filter_map(|name| {
            family.parse_numbered(&name).map(|(index, compression)| Member {
                path: family.dir.join(&name),
                position: Position::Index(index),
                compression,
            })
        })
        .collect();
    members.sort_by(|a, b| b.index().cmp(&a.index()).then(a.compression.cmp(&b.compression)));
    Ok(members)
}

pub fn dated_members(family: &Family) -> Result<Vec<Member>> {
    Ok(entry_names(&family.dir)?
        .into_iter()
        .filter_map(|name| {
            family.parse_dated(&name).map(|(date, compression)| Member {
                path: family.dir.join(&name),
                position: Position::Dated(date),
                compression,
            })
        })
        .collect())
}

fn rename(from: &Path, to: &Path, run_mode: RunMode) -> Result<()> {
    if run_mode.dry_run {
        println!("dry-run: mv {} {}", from.display(), to.display());
        return Ok(());
    }
    if fs::symlink_metadata(to).is_ok() {
        return Err(BackupkitError::message(format!(
            "rotate {}: target {} already exists",
            from.display(),
            to.display()
        )));
    }
    debug!(from = %from.display(), to = %to.display(), "rotate");
    fs::rename(from, to).map_err(|e| {
        BackupkitError::message(format!("rename {} to {}: {}", from.display(), to.display(), e))
    })
}

pub fn rotate_numbered(family: &Family, run_mode: RunMode) -> Result<usize> {
    let mut renamed = 0;
    for member in numbered_members(family)? {
        let Some(index) = member.index() else {
            continue;
        };
        let next = index.checked_add(1).ok_or_else(|| {
            BackupkitError::message(format!(
                "rotate {}: index {} cannot be shifted",
                member.path.display(),
                index
            ))
        })?;
        let target = family.numbered_path(next, member.compression);
        rename(&member.path, &target, run_mode)?;
        renamed += 1;
    }
    for member in current_members(family)? {
        let target = family.numbered_path(1, member.compression);
        rename(&member.path, &target, run_mode)?;
        renamed += 1;
    }
    Ok(renamed)
}

fn is_older_than_days(path: &Path, days: u64) -> io::Result<bool> {
    Ok(age_of(path)? > Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY)))
}

fn remove(member: &Member, reason: &str, run_mode: RunMode) -> Result<()> {
    if run_mode.dry_run {
        println!("dry-run: rm -rf {} ({})", member.path.display(), reason);
        return Ok(());
    }
    info!(path = %member.path.display(), reason, "prune");
    remove_path(&member.path)
        .map_err(|e| BackupkitError::message(format!("remove {}: {}", member.path.display(), e)))
}

pub fn prune_numbered(
    family: &Family,
    max_count: u64,
    max_days: u64,
    run_mode: RunMode,
) -> Result<usize> {
    let mut removed = 0;
    for member in numbered_members(family)? {
        let Some(index) = member.index() else {
            continue;
        };
        if max_count != 0 && index >= max_count {
            remove(&member, "count", run_mode)?;
            removed += 1;
        } else if max_days != 0 && is_older_than_days(&member.path, max_days)? {
            remove(&member, "age", run_mode)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Delete dated members older than `max_days`; zero disables pruning.
///
/// There is no count limit for dated families: the date text follows a
/// configurable format, so members cannot be ordered reliably by name.
pub fn prune_dated(family: &Family, max_days: u64, run_mode: RunMode) -> Result<usize> {
    if max_days == 0 {
        return Ok(0);
    }
    let mut removed = 0;
    for member in dated_members(family)? {
        if is_older_than_days(&member.path, max_days)? {
            remove(&member, "age", run_mode)?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn rotate_family(settings: &FamilySettings, run_mode: RunMode) -> Result<()> {
    let family = settings.family()?;
    match settings.layout {
        Layout::Single | Layout::Append => {
            debug!(family = %family.current_path().display(), layout = settings.layout.as_str(), "no rotation");
        }
        Layout::Number => {
            let renamed = rotate_numbered(&family, run_mode)?;
            let removed = prune_numbered(&family, settings.max_count, settings.max_days, run_mode)?;
            debug!(family = %family.current_path().display(), renamed, removed, "rotated");
        }
        Layout::Date => {
            let removed = prune_dated(&family, settings.max_days, run_mode)?;
            debug!(family = %family.current_path().display(), removed, "pruned");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::PathBuf;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::write(path, contents).expect("write");
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {}", path.display(), e))
    }

    fn age(path: &Path, days: u64) {
        let file = File::open(path).expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(days * SECONDS_PER_DAY + 60))
            .expect("set mtime");
    }

    fn names(dir: &Path) -> Vec<String> {
        entry_names(dir).expect("list")
    }

    #[test]
    fn rotate_with_no_history_moves_current_to_one() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        write(&dir.path().join("backup"), "current");
        assert_eq!(rotate_numbered(&fam, RunMode::default()).expect("rotate"), 1);
        assert_eq!(names(dir.path()), vec!["backup.1"]);
        assert_eq!(read(dir.path().join("backup.1")), "current");
    }

    #[test]
    fn rotate_shifts_every_member_by_one() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        write(&dir.path().join("backup"), "c");
        for i in 1..=3 {
            write(&dir.path().join(format!("backup.{}", i)), &format!("v{}", i));
        }
        rotate_numbered(&fam, RunMode::default()).expect("rotate");
        assert_eq!(
            names(dir.path()),
            vec!["backup.1", "backup.2", "backup.3", "backup.4"]
        );
        assert_eq!(read(dir.path().join("backup.1")), "c");
        for i in 1..=3 {
            assert_eq!(read(dir.path().join(format!("backup.{}", i + 1))), format!("v{}", i));
        }
    }

    #[test]
    fn rotate_keeps_compressed_variants_in_their_slot() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "dump", ".", ".sql");
        write(&dir.path().join("dump.sql"), "c");
        write(&dir.path().join("dump.1.sql.gz"), "one");
        write(&dir.path().join("dump.2.sql.xz"), "two");
        rotate_numbered(&fam, RunMode::default()).expect("rotate");
        assert_eq!(
            names(dir.path()),
            vec!["dump.1.sql", "dump.2.sql.gz", "dump.3.sql.xz"]
        );
    }

    #[test]
    fn rotate_preserves_gaps_and_ignores_strangers() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        write(&dir.path().join("backup.1"), "one");
        write(&dir.path().join("backup.4"), "four");
        write(&dir.path().join("backups.1"), "other");
        write(&dir.path().join("backup.old"), "other");
        rotate_numbered(&fam, RunMode::default()).expect("rotate");
        assert_eq!(
            names(dir.path()),
            vec!["backup.2", "backup.5", "backup.old", "backups.1"]
        );
    }

    #[test]
    fn rotate_refuses_index_that_cannot_grow() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        let last = format!("backup.{}", u64::MAX);
        write(&dir.path().join(&last), "last");
        write(&dir.path().join("backup"), "current");
        let err = rotate_numbered(&fam, RunMode::default()).expect_err("overflow");
        assert!(err.to_string().contains("cannot be shifted"), "{}", err);
        assert_eq!(names(dir.path()), vec!["backup".to_string(), last]);
    }

    #[test]
    fn rotate_moves_directories() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "snapshot", "-", "");
        fs::create_dir_all(dir.path().join("snapshot/etc")).expect("mkdir");
        fs::create_dir_all(dir.path().join("snapshot-1")).expect("mkdir");
        write(&dir.path().join("snapshot-1/marker"), "old");
        rotate_numbered(&fam, RunMode::default()).expect("rotate");
        assert!(dir.path().join("snapshot-1/etc").is_dir());
        assert_eq!(read(dir.path().join("snapshot-2/marker")), "old");
    }

    #[test]
    fn rotate_empty_directory_is_noop() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        assert_eq!(rotate_numbered(&fam, RunMode::default()).expect("rotate"), 0);
        let missing = Family::new(dir.path().join("missing"), "backup", ".", "");
        assert_eq!(rotate_numbered(&missing, RunMode::default()).expect("rotate"), 0);
    }

    #[test]
    fn prune_by_count_treats_slot_as_unit() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        for name in ["backup.1", "backup.2", "backup.3", "backup.3.gz", "backup.30"] {
            write(&dir.path().join(name), name);
        }
        let removed = prune_numbered(&fam, 3, 0, RunMode::default()).expect("prune");
        assert_eq!(removed, 3);
        assert_eq!(names(dir.path()), vec!["backup.1", "backup.2"]);
    }

    #[test]
    fn prune_by_age_keeps_numbers() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        for i in 1..=3 {
            write(&dir.path().join(format!("backup.{}", i)), "x");
        }
        age(&dir.path().join("backup.2"), 10);
        let removed = prune_numbered(&fam, 0, 7, RunMode::default()).expect("prune");
        assert_eq!(removed, 1);
        assert_eq!(names(dir.path()), vec!["backup.1", "backup.3"]);
    }

    #[test]
    fn prune_with_no_limits_keeps_everything() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        for i in 1..=5 {
            let path = dir.path().join(format!("backup.{}", i));
            write(&path, "x");
            age(&path, 400);
        }
        assert_eq!(prune_numbered(&fam, 0, 0, RunMode::default()).expect("prune"), 0);
        assert_eq!(names(dir.path()).len(), 5);
    }

    #[test]
    fn prune_twice_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        for i in 1..=6 {
            write(&dir.path().join(format!("backup.{}", i)), "x");
        }
        age(&dir.path().join("backup.1"), 30);
        let first = prune_numbered(&fam, 4, 7, RunMode::default()).expect("prune");
        let after_first = names(dir.path());
        let second = prune_numbered(&fam, 4, 7, RunMode::default()).expect("prune");
        assert_eq!(first, 4);
        assert_eq!(second, 0);
        assert_eq!(names(dir.path()), after_first);
    }

    #[test]
    fn prune_removes_directories() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "snapshot", "-", "");
        fs::create_dir_all(dir.path().join("snapshot-5/data")).expect("mkdir");
        write(&dir.path().join("snapshot-5/data/file"), "x");
        prune_numbered(&fam, 2, 0, RunMode::default()).expect("prune");
        assert!(!dir.path().join("snapshot-5").exists());
    }

    #[test]
    fn prune_dated_removes_only_old_members() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "output.log", ".", "");
        for name in ["output.log", "output.log.2025-01-01.gz", "output.log.2025-03-01"] {
            write(&dir.path().join(name), "x");
        }
        age(&dir.path().join("output.log"), 90);
        age(&dir.path().join("output.log.2025-01-01.gz"), 90);
        assert_eq!(prune_dated(&fam, 30, RunMode::default()).expect("prune"), 1);
        assert_eq!(prune_dated(&fam, 30, RunMode::default()).expect("prune"), 0);
        assert_eq!(names(dir.path()), vec!["output.log", "output.log.2025-03-01"]);
        assert_eq!(prune_dated(&fam, 0, RunMode::default()).expect("prune"), 0);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let fam = Family::new(dir.path(), "backup", ".", "");
        write(&dir.path().join("backup"), "c");
        write(&dir.path().join("backup.9"), "x");
        let mode = RunMode {
            dry_run: true,
            ..RunMode::default()
        };
        rotate_numbered(&fam, mode).expect("rotate");
        prune_numbered(&fam, 2, 0, mode).expect("prune");
        assert_eq!(names(dir.path()), vec!["backup", "backup.9"]);
    }
}
