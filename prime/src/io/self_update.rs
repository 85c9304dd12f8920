//! Replacement of the engine's own source file.
//!
//! The sequence is: copy the current file to `<source>.bak.<unix-millis>`
//! and fsync it, then write the new contents to a temp file beside the
//! source and rename it into place. A crash between the two steps leaves the
//! prior version intact at both paths. Updates are serialized process-wide.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

/// Result of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpdateOutcome {
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub bytes_written: usize,
}

#[derive(Debug)]
pub struct SelfUpdater {
    source_path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl SelfUpdater {
    pub fn new(source_path: Option<PathBuf>) -> Self {
        Self {
            source_path,
            lock: Mutex::new(()),
        }
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    #[instrument(skip_all, fields(bytes = new_source.len()))]
    pub fn apply(&self, new_source: &str, now: DateTime<Utc>) -> Result<SelfUpdateOutcome> {
        let Some(source_path) = self.source_path.as_deref() else {
            bail!("self-update is not configured (self_update.source_path is unset)");
        };
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("self-update lock poisoned"))?;

        if !source_path.is_file() {
            bail!("engine source {} does not exist", source_path.display());
        }
        let backup_path = backup_path_for(source_path, now.timestamp_millis());
        fs::copy(source_path, &backup_path).with_context(|| {
            format!(
                "back up {} to {}",
                source_path.display(),
                backup_path.display()
            )
        })?;
        File::open(&backup_path)
            .and_then(|file| file.sync_all())
            .with_context(|| format!("sync backup {}", backup_path.display()))?;
        info!(backup = %backup_path.display(), "engine source backed up");

        replace_file(source_path, new_source.as_bytes())?;
        info!(source = %source_path.display(), "engine source replaced");

        Ok(SelfUpdateOutcome {
            source_path: source_path.to_path_buf(),
            backup_path,
            bytes_written: new_source.len(),
        })
    }
}

/// First free `<source>.bak.<millis>` name, bumping the stamp on collision.
fn backup_path_for(source: &Path, millis: i64) -> PathBuf {
    let mut stamp = millis;
    loop {
        let mut name = OsString::from(source.as_os_str());
        name.push(format!(".bak.{stamp}"));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        stamp += 1;
    }
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents).context("write new source")?;
    tmp.as_file().sync_all().context("sync new source")?;
    fs::set_permissions(tmp.path(), permissions).context("copy source permissions")?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("rename new source into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_backs_up_then_replaces() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("engine.py");
        fs::write(&source, "print('v1')\n").expect("write");
        let updater = SelfUpdater::new(Some(source.clone()));

        let outcome = updater.apply("print('v2')\n", Utc::now()).expect("apply");

        assert_eq!(fs::read_to_string(&source).expect("read"), "print('v2')\n");
        assert_eq!(
            fs::read_to_string(&outcome.backup_path).expect("read backup"),
            "print('v1')\n"
        );
        let backups: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn colliding_stamps_get_distinct_backups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("engine.py");
        fs::write(&source, "v1").expect("write");
        let updater = SelfUpdater::new(Some(source));
        let now = Utc::now();
        let first = updater.apply("v2", now).expect("first");
        let second = updater.apply("v3", now).expect("second");
        assert_ne!(first.backup_path, second.backup_path);
        assert_eq!(fs::read_to_string(&second.backup_path).expect("read"), "v2");
    }

    #[test]
    fn unconfigured_updater_refuses() {
        let err = SelfUpdater::new(None).apply("x", Utc::now()).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
