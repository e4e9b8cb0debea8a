use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{Context, Result};

use util::PathEncodingError;

/// Utility fns
mod ops;

/// Fns for creating common paths in working and output directories
pub mod paths;

/// Per-node working directories
mod work_dirs;
pub use work_dirs::{Retention, WorkDirs};

/// Publishing node outputs into the output tree
mod sink;
pub use sink::ResultSink;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Path is neither file nor dir: {0}")]
    UnknownPathType(String),
    #[error("Specified directory \"{0}\" is not a directory")]
    NotDirectory(String),
    #[error("Can't perform IO operation: \"{0}\" is not whitelisted")]
    NotWhitelisted(String),
    #[error("Unable to allocate working directory {path:?}: {reason}")]
    DirectoryAllocation { path: PathBuf, reason: String },
    #[error(
        "Unable to publish {} artifact(s) for {subject}:\n  {}",
        .failures.len(),
        .failures.join("\n  ")
    )]
    Publish {
        subject: String,
        failures: Vec<String>,
    },
}

/// All destructive file operations in the crate should go through this struct.
///
/// Every destructive operation checks that the path in question is a child of one
/// of the whitelisted prefixes (the working, tool-output, and final output roots),
/// otherwise it will not be performed. External commands are not bound by this;
/// they only receive paths under those roots.
#[derive(Debug, Clone)]
pub struct Fs {
    /// The directories we are allowed to modify
    prefixes: Vec<PathBuf>,
}

impl Fs {
    /// Create a new `Fs` allowed to modify anything under `prefixes`.
    pub fn new<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.as_ref().to_path_buf())
                .collect(),
        }
    }

    /// Check whether `dir` exists, and create it if not.
    /// Returns the canonicalized path.
    pub fn ensure_dir_exists(&self, dir: &Path, verbose: bool) -> Result<PathBuf> {
        if !dir.exists() {
            log::info!("Directory {:?} doesn't exist. Creating.", dir);
            self.create_dir(dir)?;
        } else if !dir.is_dir() {
            return Err(Error::NotDirectory(path_string(dir)?).into());
        } else if verbose {
            log::info!("Directory {:?} already exists. Not creating.", dir);
        }
        let canonical = dir
            .canonicalize()
            .with_context(|| format!("canonicalizing {:?}", dir))?;
        Ok(canonical)
    }

    /// Check if path exists on disk.
    pub fn exists<T: AsRef<Path>>(&self, path: T) -> bool {
        let path = path.as_ref();
        path.exists() || path.is_symlink()
    }

    /// Create a directory (uses `std::fs::create_dir_all`, so an entire tree of dirs can be created).
    pub fn create_dir<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        fs::create_dir_all(path).with_context(|| format!("creating dir {:?}", path))?;
        Ok(())
    }

    /// Create a file, and return a writable `File` handle.
    pub fn create_file<T: AsRef<Path>>(&self, path: T) -> Result<fs::File> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        let f = fs::File::create(path).with_context(|| format!("creating file {:?}", path))?;
        Ok(f)
    }

    /// Write entire str to a file.
    pub fn write_file<T: AsRef<Path>>(&self, path: T, text: &str) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        fs::write(path, text).with_context(|| format!("writing file {:?}", path))?;
        Ok(())
    }

    /// Delete a file, symlink, or directory tree, if it exists.
    pub fn remove<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        if !self.exists(path) {
            return Ok(());
        }
        self.check_whitelist(path)?;
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
        .with_context(|| format!("removing {:?}", path))?;
        Ok(())
    }

    /// Hard-link `src` to `tgt`, or copy it if linking isn't possible
    /// (e.g. across filesystems). Directories are copied recursively.
    pub fn link_or_copy<T: AsRef<Path>, U: AsRef<Path>>(&self, src: T, tgt: U) -> Result<()> {
        let (src, tgt) = (src.as_ref(), tgt.as_ref());
        self.check_whitelist(tgt)?;
        ops::link_or_copy(src, tgt)
            .with_context(|| format!("publishing {:?} to {:?}", src, tgt))?;
        Ok(())
    }

    /// Read entire file into a String.
    pub fn read_to_buf<T: AsRef<Path>>(&self, path: T, strbuf: &mut String) -> Result<()> {
        use std::io::Read;
        let path = path.as_ref();
        strbuf.clear();
        let cap = fs::metadata(path)?.len() as usize;
        if cap > strbuf.len() {
            strbuf.reserve(cap - strbuf.len());
        }
        let mut f = fs::File::open(path)?;
        f.read_to_string(strbuf)?;
        Ok(())
    }

    /// List entries in a directory
    pub fn read_dir<T: AsRef<Path>>(&self, path: T) -> Result<fs::ReadDir, io::Error> {
        fs::read_dir(path)
    }

    fn is_whitelisted(&self, path: &Path) -> bool {
        self.prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    fn check_whitelist(&self, path: &Path) -> Result<()> {
        if !self.is_whitelisted(path) {
            Err(Error::NotWhitelisted(path_string(path)?).into())
        } else {
            Ok(())
        }
    }
}

fn path_string(path: &Path) -> Result<String, PathEncodingError> {
    util::path_str(path).map(str::to_owned)
}
