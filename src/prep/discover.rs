use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use traverse::Errors;

use super::Error;
use crate::fs::Fs;

/// Name of the dataset-level sidecar consulted when a volume has none of its own.
const DATASET_SIDECAR: &str = "dwi.json";

/// Raw diffusion data found for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// "sub-XX"
    pub subject: String,
    pub dwis: Vec<PathBuf>,
    pub bvals: Vec<PathBuf>,
    pub bvecs: Vec<PathBuf>,
    /// one phase-encoding direction per volume, e.g. "j" or "j-"
    pub phase_encoding: Vec<String>,
    /// total readout time in seconds
    pub readout: f64,
}

/// The subset of a BIDS sidecar we read.
#[derive(Debug, Default, Clone, Deserialize)]
struct Sidecar {
    #[serde(rename = "PhaseEncodingDirection")]
    phase_encoding_direction: Option<String>,
    #[serde(rename = "TotalReadoutTime")]
    total_readout_time: Option<f64>,
    #[serde(rename = "EffectiveEchoSpacing")]
    effective_echo_spacing: Option<f64>,
    dcmmeta_shape: Option<Vec<usize>>,
}

impl Sidecar {
    /// Fill in every field missing from `self` with the one from `fallback`.
    fn or(self, fallback: &Sidecar) -> Sidecar {
        Sidecar {
            phase_encoding_direction: self
                .phase_encoding_direction
                .or_else(|| fallback.phase_encoding_direction.clone()),
            total_readout_time: self.total_readout_time.or(fallback.total_readout_time),
            effective_echo_spacing: self
                .effective_echo_spacing
                .or(fallback.effective_echo_spacing),
            dcmmeta_shape: self.dcmmeta_shape.or_else(|| fallback.dcmmeta_shape.clone()),
        }
    }

    /// `TotalReadoutTime`, or (number of phase-encode steps - 1) * echo spacing.
    fn readout(&self) -> Option<f64> {
        if let Some(t) = self.total_readout_time {
            return Some(t);
        }
        let steps = *self.dcmmeta_shape.as_ref()?.first()?;
        let spacing = self.effective_echo_spacing?;
        Some(steps.saturating_sub(1) as f64 * spacing)
    }
}

/// Scans a BIDS-style dataset for diffusion data.
pub struct Layout<'a> {
    root: &'a Path,
    fs: &'a Fs,
    fallback: Sidecar,
}

impl<'a> Layout<'a> {
    pub fn new(root: &'a Path, fs: &'a Fs) -> Result<Self> {
        let path = root.join(DATASET_SIDECAR);
        let fallback = if fs.exists(&path) {
            read_sidecar(fs, &path)?
        } else {
            Sidecar::default()
        };
        Ok(Self { root, fs, fallback })
    }

    /// Subject directories to process: the given labels (with or without `sub-`),
    /// or every `sub-*` directory in the dataset, sorted.
    pub fn subjects(&self, filter: &[String]) -> Result<Vec<String>> {
        if !filter.is_empty() {
            return Ok(filter.iter().map(|s| with_prefix("sub-", s)).collect());
        }
        let mut subjects = Vec::new();
        let entries = self
            .fs
            .read_dir(self.root)
            .with_context(|| format!("while listing dataset {:?}", self.root))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with("sub-") && entry.path().is_dir() {
                subjects.push(name.to_owned());
            }
        }
        subjects.sort();
        if subjects.is_empty() {
            return Err(Error::NoSubjects(self.root.to_path_buf()).into());
        }
        Ok(subjects)
    }

    /// `dwi/` directories holding this subject's data. Without a session filter,
    /// a subject without a top-level `dwi/` contributes every `ses-*/dwi/`.
    fn dwi_dirs(&self, subject: &str, session: Option<&str>) -> Result<Vec<PathBuf>> {
        let subject_dir = self.root.join(subject);
        if let Some(session) = session {
            return Ok(vec![subject_dir.join(with_prefix("ses-", session)).join("dwi")]);
        }
        let direct = subject_dir.join("dwi");
        if direct.is_dir() {
            return Ok(vec![direct]);
        }
        let mut dirs = Vec::new();
        if subject_dir.is_dir() {
            for entry in self.fs.read_dir(&subject_dir)? {
                let path = entry?.path();
                let is_session = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("ses-"));
                if is_session && path.join("dwi").is_dir() {
                    dirs.push(path.join("dwi"));
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Find volumes, gradient tables, and acquisition metadata for one subject.
    pub fn acquisition(&self, subject: &str, session: Option<&str>) -> Result<Acquisition> {
        let mut dwis = Vec::new();
        let mut bvals = Vec::new();
        let mut bvecs = Vec::new();
        let dirs = self.dwi_dirs(subject, session)?;
        for dir in &dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in self.fs.read_dir(dir)? {
                let path = entry?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if name.ends_with(".nii.gz") || name.ends_with(".nii") {
                    dwis.push(path);
                } else if name.ends_with(".bval") {
                    bvals.push(path);
                } else if name.ends_with(".bvec") {
                    bvecs.push(path);
                }
            }
        }
        dwis.sort();
        bvals.sort();
        bvecs.sort();

        if dwis.is_empty() {
            return Err(Error::NoDiffusionData {
                subject: subject.to_owned(),
                dir: dirs.into_iter().next().unwrap_or_else(|| self.root.join(subject)),
            }
            .into());
        }
        if bvals.len() != dwis.len() || bvecs.len() != dwis.len() {
            return Err(Error::TableCount {
                subject: subject.to_owned(),
                volumes: dwis.len(),
                bvals: bvals.len(),
                bvecs: bvecs.len(),
            }
            .into());
        }

        let (phase_encoding, readout) = self.diffusion_info(subject, &dwis)?;
        Ok(Acquisition {
            subject: subject.to_owned(),
            dwis,
            bvals,
            bvecs,
            phase_encoding,
            readout,
        })
    }

    /// Phase-encoding direction of each volume, and the readout time.
    /// When volumes disagree on readout time, the last one is used.
    fn diffusion_info(&self, subject: &str, dwis: &[PathBuf]) -> Result<(Vec<String>, f64)> {
        let mut phase_encoding = Vec::with_capacity(dwis.len());
        let mut readouts = Vec::with_capacity(dwis.len());
        for dwi in dwis {
            let sidecar = sidecar_path(dwi);
            let meta = if self.fs.exists(&sidecar) {
                read_sidecar(self.fs, &sidecar)?.or(&self.fallback)
            } else {
                self.fallback.clone()
            };
            let missing = |field: &str| Error::MissingMetadata {
                subject: subject.to_owned(),
                file: dwi.clone(),
                field: field.to_owned(),
            };
            let pe = meta
                .phase_encoding_direction
                .clone()
                .ok_or_else(|| missing("PhaseEncodingDirection"))?;
            let readout = meta.readout().ok_or_else(|| missing("TotalReadoutTime"))?;
            phase_encoding.push(pe);
            readouts.push(readout);
        }

        let readout = readouts.last().copied().unwrap_or_default();
        if readouts.iter().any(|r| (r - readout).abs() > f64::EPSILON) {
            log::warn!("{subject}: volumes disagree on readout time, using {readout}");
        }
        Ok((phase_encoding, readout))
    }
}

/// Discover every requested subject. A subject that can't be resolved doesn't stop
/// the others from being checked; all problems are reported together.
pub fn discover(
    fs: &Fs,
    root: &Path,
    subjects: &[String],
    session: Option<&str>,
) -> Result<Vec<Acquisition>> {
    let layout = Layout::new(root, fs)?;
    let mut found = Vec::new();
    let mut errors = Errors::default();
    for subject in layout.subjects(subjects)? {
        match layout.acquisition(&subject, session) {
            Ok(acq) => {
                log::debug!(
                    "{subject}: {} volumes, readout {}",
                    acq.dwis.len(),
                    acq.readout
                );
                found.push(acq);
            }
            Err(e) => errors.add_context(e, format!("while discovering {subject}")),
        }
    }
    errors.print_recap("discovering subjects")?;
    Ok(found)
}

fn read_sidecar(fs: &Fs, path: &Path) -> Result<Sidecar> {
    let mut strbuf = String::with_capacity(1024);
    fs.read_to_buf(path, &mut strbuf)?;
    serde_json::from_str(&strbuf).with_context(|| format!("while parsing sidecar {:?}", path))
}

/// `x.nii.gz` and `x.nii` both have sidecar `x.json`.
fn sidecar_path(dwi: &Path) -> PathBuf {
    let name = dwi.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name);
    dwi.with_file_name(format!("{stem}.json"))
}

fn with_prefix(prefix: &str, label: &str) -> String {
    if label.starts_with(prefix) {
        label.to_owned()
    } else {
        format!("{prefix}{label}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_subject(root: &Path, subject: &str, sidecars: &[&str]) -> Result<()> {
        let dir = root.join(subject).join("dwi");
        fs::create_dir_all(&dir)?;
        for (i, sidecar) in sidecars.iter().enumerate() {
            let stem = format!("{subject}_run-{}_dwi", i + 1);
            fs::write(dir.join(format!("{stem}.nii.gz")), "")?;
            fs::write(dir.join(format!("{stem}.bval")), "0 1000\n")?;
            fs::write(dir.join(format!("{stem}.bvec")), "1 0\n0 1\n0 0\n")?;
            fs::write(dir.join(format!("{stem}.json")), sidecar)?;
        }
        Ok(())
    }

    #[test]
    fn test_discover_with_readout_fallback() -> Result<()> {
        let dir = tempdir()?;
        write_subject(
            dir.path(),
            "sub-01",
            &[
                r#"{"PhaseEncodingDirection": "j", "TotalReadoutTime": 0.05}"#,
                r#"{"PhaseEncodingDirection": "j-", "dcmmeta_shape": [97, 96, 60], "EffectiveEchoSpacing": 0.0005}"#,
            ],
        )?;
        write_subject(dir.path(), "sub-02", &[r#"{"PhaseEncodingDirection": "j", "TotalReadoutTime": 0.04}"#])?;
        fs::create_dir(dir.path().join("derivatives"))?;

        let found = discover(&Fs::new([dir.path()]), dir.path(), &[], None)?;
        assert_eq!(found.len(), 2);
        let first = &found[0];
        assert_eq!(first.subject, "sub-01");
        assert_eq!(first.dwis.len(), 2);
        assert_eq!(first.phase_encoding, vec!["j", "j-"]);
        assert!((first.readout - 0.048).abs() < 1e-9);
        assert_eq!(found[1].readout, 0.04);
        Ok(())
    }

    #[test]
    fn test_explicit_subjects_and_dataset_sidecar() -> Result<()> {
        let dir = tempdir()?;
        write_subject(dir.path(), "sub-01", &["{}"])?;
        write_subject(dir.path(), "sub-02", &["{}"])?;
        fs::write(
            dir.path().join("dwi.json"),
            r#"{"PhaseEncodingDirection": "j-", "TotalReadoutTime": 0.07}"#,
        )?;

        let found = discover(&Fs::new([dir.path()]), dir.path(), &["02".to_owned()], None)?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].subject, "sub-02");
        assert_eq!(found[0].phase_encoding, vec!["j-"]);
        assert_eq!(found[0].readout, 0.07);
        Ok(())
    }

    #[test]
    fn test_session_filter() -> Result<()> {
        let dir = tempdir()?;
        let ses = dir.path().join("sub-01").join("ses-pre");
        write_subject(&ses, "", &[r#"{"PhaseEncodingDirection": "j", "TotalReadoutTime": 0.05}"#])?;
        let fs = Fs::new([dir.path()]);
        let layout = Layout::new(dir.path(), &fs)?;
        let acq = layout.acquisition("sub-01", Some("pre"))?;
        assert_eq!(acq.dwis.len(), 1);
        let acq = layout.acquisition("sub-01", None)?;
        assert_eq!(acq.dwis.len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_metadata() -> Result<()> {
        let dir = tempdir()?;
        write_subject(dir.path(), "sub-01", &[r#"{"TotalReadoutTime": 0.05}"#])?;
        let fs = Fs::new([dir.path()]);
        let layout = Layout::new(dir.path(), &fs)?;
        let e = layout.acquisition("sub-01", None).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::MissingMetadata { subject, field, file }) => {
                assert_eq!(subject, "sub-01");
                assert_eq!(field, "PhaseEncodingDirection");
                assert!(file.ends_with("sub-01_run-1_dwi.nii.gz"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let e = discover(&Fs::new([dir.path()]), dir.path(), &[], None).unwrap_err();
        assert!(e.to_string().contains("1 errors"));
        Ok(())
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/d/sub-01_dwi.nii.gz")),
            PathBuf::from("/d/sub-01_dwi.json")
        );
        assert_eq!(
            sidecar_path(Path::new("/d/sub-01_dwi.nii")),
            PathBuf::from("/d/sub-01_dwi.json")
        );
    }
}
