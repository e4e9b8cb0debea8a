use std::path::PathBuf;

/// Find subjects, volumes, gradient tables, and sidecar metadata in a dataset.
mod discover;
pub use discover::{discover, Acquisition};

/// Immutable per-subject parameters.
mod context;
pub use context::SubjectContext;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No sub-* directories found in {0:?}")]
    NoSubjects(PathBuf),
    #[error("No diffusion volumes found for {subject} in {dir:?}")]
    NoDiffusionData { subject: String, dir: PathBuf },
    #[error(
        "{subject} has {volumes} volumes but {bvals} b-value and {bvecs} b-vector tables"
    )]
    TableCount {
        subject: String,
        volumes: usize,
        bvals: usize,
        bvecs: usize,
    },
    #[error("{subject}: no \"{field}\" in metadata for {file:?}")]
    MissingMetadata {
        subject: String,
        file: PathBuf,
        field: String,
    },
}
