//! Path resolution and derived filesystem locations.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::StoreError;

/// File name used when no explicit path is given.
pub const DEFAULT_FILE_NAME: &str = "config.yaml";

const BACKUP_DIR: &str = "backup";
const TESTS_DIR: &str = "tests";
const DATE_FORMAT: &str = "%Y%m%d";
const TIME_FORMAT: &str = "%H%M%S";

/// Lexically normalizes a path: drops `.` segments and folds `..` into its parent.
///
/// The filesystem is never consulted, so symlinks are not resolved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Rewrites backslash separators as forward slashes.
pub fn portable(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().replace('\\', "/"))
}

/// Makes `path` absolute against the working directory, then normalizes it.
///
/// Backslashes are treated as separators on every platform.
pub fn absolute(path: &Path) -> Result<PathBuf, StoreError> {
    let path = portable(path);
    let path = path.as_path();
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    let cwd = current_dir()?;
    Ok(normalize(&cwd.join(path)))
}

/// The working directory, with failures mapped to [`StoreError::DirectoryFailed`].
pub(crate) fn current_dir() -> Result<PathBuf, StoreError> {
    std::env::current_dir().map_err(|e| StoreError::DirectoryFailed {
        path: PathBuf::from("."),
        source: e,
    })
}

/// Resolves the configuration file a manager should use.
///
/// An explicit path wins. Otherwise the nearest ancestor of the working
/// directory that contains a `src` directory is the project root and the file
/// lives at `<root>/src/config/config.yaml`; without a project root it is
/// `<cwd>/config/config.yaml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, StoreError> {
    if let Some(path) = explicit {
        return absolute(path);
    }

    let cwd = current_dir()?;
    let config_dir = match find_project_root(&cwd) {
        Some(root) => root.join("src").join("config"),
        None => cwd.join("config"),
    };
    Ok(normalize(&config_dir.join(DEFAULT_FILE_NAME)))
}

/// Walks up from `start` looking for a directory with a `src` child.
///
/// A directory that is itself named `src` is never the root.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .filter(|dir| dir.file_name().map_or(true, |name| name != "src"))
        .find(|dir| dir.join("src").is_dir())
        .map(Path::to_path_buf)
}

/// Backup location for `config_path` at `time`:
/// `<dir>/backup/<YYYYMMDD>/<HHMMSS>/<stem>_<YYYYMMDD>_<HHMMSS>.yaml`.
pub fn backup_path(config_path: &Path, time: &NaiveDateTime) -> PathBuf {
    let date = time.format(DATE_FORMAT).to_string();
    let clock = time.format(TIME_FORMAT).to_string();
    let stem = config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());

    backup_root(config_path)
        .join(&date)
        .join(&clock)
        .join(format!("{}_{}_{}.yaml", stem, date, clock))
}

fn backup_root(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(BACKUP_DIR)
}

/// Lists backup files written for `config_path`, newest first.
pub fn list_backups(config_path: &Path) -> Vec<PathBuf> {
    let root = backup_root(config_path);
    let prefix = format!(
        "{}_",
        config_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    );

    let mut backups: Vec<PathBuf> = WalkDir::new(&root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".yaml")
        })
        .map(|entry| entry.into_path())
        .collect();

    // Date and time directories sort lexically in chronological order.
    backups.sort_by(|a, b| b.cmp(a));
    backups
}

/// Creates `dir` and its parents.
///
/// Returns `Ok(false)` when permissions prevent it; that case is only logged.
pub fn ensure_dir(dir: &Path) -> Result<bool, StoreError> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            warn!(path = %dir.display(), error = %e, "No permission to create directory, skipping");
            Ok(false)
        }
        Err(e) => Err(StoreError::DirectoryFailed {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Root of every isolated test environment: `<temp>/tests`.
pub fn test_environments_root() -> PathBuf {
    std::env::temp_dir().join(TESTS_DIR)
}

/// A fresh, uniquely named test directory under `root`:
/// `<root>/<YYYYMMDD>/<HHMMSS>_<8 hex>`.
pub fn new_test_environment(root: &Path, now: &NaiveDateTime) -> PathBuf {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    root.join(now.format(DATE_FORMAT).to_string()).join(format!(
        "{}_{}",
        now.format(TIME_FORMAT),
        &unique[..8]
    ))
}

/// Prepares an isolated copy of `production` for test mode.
///
/// The test file keeps the production file name; if the production file
/// exists its content is the starting point.
pub fn prepare_test_config(production: &Path) -> Result<PathBuf, StoreError> {
    prepare_test_config_in(&test_environments_root(), production, &Local::now().naive_local())
}

/// [`prepare_test_config`] with an explicit environments root and clock.
///
/// When the environment directory cannot be created for lack of permission
/// the copy is skipped and the returned path is left for the caller to create.
pub fn prepare_test_config_in(
    root: &Path,
    production: &Path,
    now: &NaiveDateTime,
) -> Result<PathBuf, StoreError> {
    let dir = new_test_environment(root, now);
    let created = ensure_dir(&dir)?;

    let file_name = production
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| DEFAULT_FILE_NAME.into());
    let test_path = dir.join(file_name);

    if created && production.is_file() {
        fs::copy(production, &test_path).map_err(|e| StoreError::WriteFailed {
            path: test_path.clone(),
            source: e,
        })?;
        debug!(from = %production.display(), to = %test_path.display(), "Copied production config into test environment");
    }

    info!(path = %test_path.display(), "Using isolated test configuration");
    Ok(test_path)
}

/// Removes dated test directories older than `days` from the default root.
pub fn cleanup_old_test_environments(days: u32) -> usize {
    cleanup_test_environments_in(&test_environments_root(), days, Local::now().naive_local())
}

/// Removes `<root>/<YYYYMMDD>` directories dated before `now - days`.
///
/// Entries that are not dated directories are left alone. Returns how many
/// directories were removed.
pub fn cleanup_test_environments_in(root: &Path, days: u32, now: NaiveDateTime) -> usize {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Failed to read test environments");
            return 0;
        }
    };

    let cutoff = now - ChronoDuration::days(i64::from(days));
    let mut removed = 0;

    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(date) = NaiveDate::parse_from_str(&name, DATE_FORMAT) else {
            continue;
        };
        if date.and_hms_opt(0, 0, 0).map_or(false, |start| start < cutoff) {
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Removed old test environment");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove test environment"),
            }
        }
    }

    removed
}
