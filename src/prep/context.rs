use std::path::{Path, PathBuf};

use super::Acquisition;

/// Everything one subject's graph is built from. Created once per subject
/// before graph construction and never changed afterwards; its values reach
/// the graph only as node constants.
#[derive(Debug, Clone)]
pub struct SubjectContext {
    /// "sub-XX"
    pub subject: String,
    pub dwis: Vec<PathBuf>,
    pub bvals: Vec<PathBuf>,
    pub bvecs: Vec<PathBuf>,
    pub phase_encoding: Vec<String>,
    /// total readout time in seconds
    pub readout: f64,
    /// TRACULA config template
    pub tracula_config: PathBuf,
    /// TRACULA output tree for this subject (`TRACDIR/sub-XX`)
    pub tracula_dir: PathBuf,
    /// where the sink publishes (`OUTDIR/sub-XX`)
    pub out_dir: PathBuf,
}

impl SubjectContext {
    pub fn new(acq: Acquisition, tracula_config: &Path, trac_root: &Path, out_root: &Path) -> Self {
        Self {
            tracula_dir: trac_root.join(&acq.subject),
            out_dir: out_root.join(&acq.subject),
            tracula_config: tracula_config.to_path_buf(),
            subject: acq.subject,
            dwis: acq.dwis,
            bvals: acq.bvals,
            bvecs: acq.bvecs,
            phase_encoding: acq.phase_encoding,
            readout: acq.readout,
        }
    }

    /// Subject label without the `sub-` prefix.
    pub fn label(&self) -> &str {
        self.subject.strip_prefix("sub-").unwrap_or(&self.subject)
    }

    /// TRACULA's `dtroot`; trac-all nests each subject one level further down.
    pub fn dtroot(&self) -> &Path {
        &self.tracula_dir
    }

    /// `dtroot/sub-XX`, where trac-all writes `dmri/` and `dlabel/`.
    pub fn tracula_subject_dir(&self) -> PathBuf {
        self.tracula_dir.join(&self.subject)
    }
}
