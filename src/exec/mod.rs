use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use graph::{Bindings, NodeId, TaskNode};

use crate::fs::Fs;

/// Drives a graph run to completion
mod executor;
pub use executor::Executor;

/// Runs a single node body
mod task;

/// Run a subprocess
mod run_cmd;

/// `command.sh` builder
mod script;

/// Thread-count environment save/restore
mod env_guard;
pub use env_guard::ThreadEnvGuard;

/// Bounded in-process worker pool
mod local;
pub use local::LocalBackend;

/// Slurm batch-queue backend
mod remote;
pub use remote::{JobStatus, QueueClient, Slurm, SlurmBackend, SlurmOptions};

/// Per-subject run summary
mod summary;
pub use summary::{NodeReport, RunReport};

/// Output captured from a failed command.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Task \"{node}\" failed: {cause}")]
    TaskExecution {
        node: String,
        cause: String,
        captured: Option<Captured>,
    },
    #[error("Task \"{node}\" timed out after {limit:?}")]
    Timeout { node: String, limit: Duration },
    #[error("Task \"{node}\" was cancelled")]
    Cancelled { node: String },
}

impl Error {
    pub(crate) fn execution<S: Into<String>>(node: &str, cause: S) -> Self {
        Self::TaskExecution {
            node: node.to_owned(),
            cause: cause.into(),
            captured: None,
        }
    }
}

/// Settings shared by every node execution in a run.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub fs: Fs,
    /// default per-node timeout (a node's own hint takes precedence)
    pub timeout: Option<Duration>,
    /// raised to stop dispatch and kill running commands
    pub cancel: Arc<AtomicBool>,
    /// echo subprocess output to stderr
    pub echo: bool,
}

impl Runtime {
    pub fn new(fs: Fs) -> Self {
        Self {
            fs,
            timeout: None,
            cancel: Arc::new(AtomicBool::new(false)),
            echo: false,
        }
    }

    fn timeout_for(&self, node: &TaskNode) -> Option<Duration> {
        node.resource_hints().timeout.or(self.timeout)
    }
}

/// A bound node, ready to be handed to a backend.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: NodeId,
    pub node: TaskNode,
    pub inputs: Bindings,
    pub work_dir: PathBuf,
}

/// A job that reached an end, successfully or not.
#[derive(Debug)]
pub struct Finished {
    pub id: NodeId,
    pub outcome: Result<Bindings>,
}

/// An execution backend runs bound nodes and reports when they finish.
///
/// The executor never has more than `capacity()` jobs submitted at once.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn capacity(&self) -> usize;

    /// Hand `job` off for execution. An error means the job was rejected
    /// and will never run.
    fn submit(&mut self, job: Job) -> Result<()>;

    /// Block until some submitted job finishes.
    fn wait(&mut self) -> Result<Finished>;
}
