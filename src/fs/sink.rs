use std::path::{Path, PathBuf};

use graph::Value;

use super::{paths, Error, Fs};

/// Publishes node outputs into `$OUTDIR/subject/container/`.
#[derive(Debug, Clone)]
pub struct ResultSink {
    root: PathBuf,
    fs: Fs,
}

impl ResultSink {
    pub fn new(root: &Path, fs: Fs) -> Self {
        Self {
            root: root.to_path_buf(),
            fs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Link or copy every file of `value` into the subject's `container`
    /// (an empty container means the subject root). Returns the published paths.
    pub fn publish(
        &self,
        subject: &str,
        container: &str,
        value: &Value,
    ) -> Result<Vec<PathBuf>, Error> {
        let dir = paths::publish_dir(&self.root, subject, container);
        let files = value.files();
        let mut published = Vec::with_capacity(files.len());
        let mut failures = Vec::with_capacity(0);

        if let Err(e) = self.fs.create_dir(&dir) {
            return Err(Error::Publish {
                subject: subject.to_owned(),
                failures: vec![format!("{:?}: {e:#}", dir)],
            });
        }

        for src in files {
            match self.publish_one(src, &dir) {
                Ok(tgt) => published.push(tgt),
                Err(msg) => failures.push(msg),
            }
        }

        if failures.is_empty() {
            Ok(published)
        } else {
            Err(Error::Publish {
                subject: subject.to_owned(),
                failures,
            })
        }
    }

    /// Publish each `(container, value)` pair, attempting all of them even if some fail.
    pub fn publish_all<'a, I>(&self, subject: &str, items: I) -> Result<Vec<PathBuf>, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut published = Vec::with_capacity(16);
        let mut failures = Vec::with_capacity(0);
        for (container, value) in items {
            match self.publish(subject, container, value) {
                Ok(paths) => published.extend(paths),
                Err(Error::Publish { failures: f, .. }) => failures.extend(f),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(published)
        } else {
            Err(Error::Publish {
                subject: subject.to_owned(),
                failures,
            })
        }
    }

    fn publish_one(&self, src: &Path, dir: &Path) -> Result<PathBuf, String> {
        if !self.fs.exists(src) {
            return Err(format!("{:?}: source does not exist", src));
        }
        let name = src
            .file_name()
            .ok_or_else(|| format!("{:?}: source has no file name", src))?;
        let tgt = dir.join(name);
        self.fs
            .link_or_copy(src, &tgt)
            .map_err(|e| format!("{:?}: {e:#}", src))?;
        log::debug!("published {:?}", tgt);
        Ok(tgt)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_publish_layout() -> Result<()> {
        let dir = tempdir()?;
        let work = dir.path().join("work");
        let out = dir.path().join("out");
        fs::create_dir_all(&work)?;
        let fa = work.join("sub-01_tensor_fa.nii.gz");
        fs::write(&fa, "fa")?;

        let sink = ResultSink::new(&out, Fs::new([&out]));
        let published = sink.publish("sub-01", "recon", &Value::File(fa))?;
        assert_eq!(
            published,
            vec![out.join("sub-01/recon/sub-01_tensor_fa.nii.gz")]
        );
        assert_eq!(fs::read_to_string(&published[0])?, "fa");

        let bvals = work.join("merged.bvals");
        fs::write(&bvals, "0.0\n1000.0\n")?;
        sink.publish("sub-01", "", &Value::File(bvals))?;
        assert!(out.join("sub-01/merged.bvals").is_file());
        Ok(())
    }

    #[test]
    fn test_publish_is_best_effort() -> Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("out");
        let present = dir.path().join("present.txt");
        fs::write(&present, "here")?;
        let missing = dir.path().join("missing.txt");

        let sink = ResultSink::new(&out, Fs::new([&out]));
        let a = Value::File(missing);
        let b = Value::File(present);
        let e = sink
            .publish_all("sub-01", [("pre", &a), ("pre", &b)])
            .unwrap_err();
        match e {
            Error::Publish { subject, failures } => {
                assert_eq!(subject, "sub-01");
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("missing.txt"));
            }
            other => panic!("unexpected error {other}"),
        }
        // the other artifact still made it:
        assert!(out.join("sub-01/pre/present.txt").is_file());
        Ok(())
    }
}
