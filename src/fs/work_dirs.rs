use std::path::{Path, PathBuf};

use anyhow::Result;

use super::{paths, Error, Fs};

/// When to keep node working directories after a subject finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Retention {
    /// Keep every directory.
    Always,
    /// Keep a subject's directories only if one of its nodes failed.
    OnFailure,
    /// Remove every directory.
    Never,
}

impl Retention {
    pub fn retain(self, subject_failed: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnFailure => subject_failed,
            Self::Never => false,
        }
    }
}

/// Allocates one isolated working directory per (subject, node).
#[derive(Debug, Clone)]
pub struct WorkDirs {
    root: PathBuf,
    fs: Fs,
    retention: Retention,
}

impl WorkDirs {
    pub fn new(root: &Path, fs: Fs, retention: Retention) -> Self {
        Self {
            root: root.to_path_buf(),
            fs,
            retention,
        }
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Return a fresh, empty `$WORKDIR/subject/step`.
    /// Anything left there by a previous run is removed first.
    pub fn allocate(&self, subject: &str, step: &str) -> Result<PathBuf, Error> {
        let dir = paths::node_dir(&self.root, subject, step);
        let prepare = || -> Result<()> {
            if self.fs.exists(&dir) {
                log::debug!("clearing stale working directory {:?}", dir);
                self.fs.remove(&dir)?;
            }
            self.fs.create_dir(&dir)
        };
        prepare().map_err(|e| Error::DirectoryAllocation {
            path: dir.clone(),
            reason: format!("{e:#}"),
        })?;
        Ok(dir)
    }

    /// Remove `dir` unless `retain` is set.
    pub fn release(&self, dir: &Path, retain: bool) -> Result<()> {
        if retain {
            log::debug!("retaining working directory {:?}", dir);
            return Ok(());
        }
        self.fs.remove(dir)
    }

    /// Release every directory of a finished subject according to the retention policy,
    /// then remove the subject directory itself if it ended up empty.
    pub fn release_subject(&self, subject: &str, dirs: &[PathBuf], failed: bool) -> Result<()> {
        let retain = self.retention.retain(failed);
        for dir in dirs {
            self.release(dir, retain)?;
        }
        let subject_dir = paths::subject_work_dir(&self.root, subject);
        if !retain && self.fs.exists(&subject_dir) {
            let empty = self.fs.read_dir(&subject_dir)?.next().is_none();
            if empty {
                self.fs.remove(&subject_dir)?;
            }
        }
        Ok(())
    }
}
