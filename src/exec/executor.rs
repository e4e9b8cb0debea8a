use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use graph::{Graph, NodeId};
use traverse::Traversal;
use util::{HashMap, HashSet, Timer};

use super::summary::RunReport;
use super::{Backend, Job};
use crate::fs::WorkDirs;
use crate::ui::Ui;

/// `Executor` walks a graph to completion.
///
/// It owns all node state through a [`Traversal`] and is the only thing that changes it.
/// Ready nodes get a fresh working directory, have their inputs gathered from upstream
/// outputs and bound, and are handed to the backend while it has capacity.
/// Completion promotes dependents; failure skips them. Unrelated nodes keep running,
/// and the run only ends once nothing is left to schedule.
pub struct Executor {
    backend: Box<dyn Backend>,
    work_dirs: WorkDirs,
    cancel: Arc<AtomicBool>,
    ui: Ui,
}

/// Working directories handed out during a run, per subject.
#[derive(Default)]
struct Allocations {
    dirs: HashMap<String, Vec<PathBuf>>,
    released: HashSet<String>,
}

impl Executor {
    pub fn new(backend: Box<dyn Backend>, work_dirs: WorkDirs, cancel: Arc<AtomicBool>, ui: Ui) -> Self {
        Self {
            backend,
            work_dirs,
            cancel,
            ui,
        }
    }

    /// Run every node of `graph`. Graph construction errors (e.g. cycles) fail immediately;
    /// node failures are reported in the returned `RunReport`.
    pub fn run(&mut self, graph: &Graph) -> Result<RunReport> {
        let mut traversal = Traversal::new(graph)?;
        let capacity = self.backend.capacity();
        log::info!(
            "running {} nodes on {} backend (capacity {capacity})",
            graph.len(),
            self.backend.name()
        );

        let mut failures: HashMap<NodeId, anyhow::Error> = HashMap::default();
        let mut allocations = Allocations::default();
        let mut running = 0usize;
        let mut cancelled = false;
        self.ui.start_timer();
        let timer = Timer::now();

        loop {
            if !cancelled && self.cancel.load(Ordering::Relaxed) {
                cancelled = true;
                let skipped = traversal.cancel_pending()?;
                self.ui.skipped(&names(graph, &skipped), "run cancelled");
            }

            while running < capacity {
                let Some(id) = traversal.next_ready() else {
                    break;
                };
                match self.dispatch(&traversal, id, &mut allocations) {
                    Ok(()) => {
                        traversal.start(id)?;
                        running += 1;
                    }
                    Err(e) => self.record_failure(&mut traversal, id, e, &mut failures)?,
                }
            }

            self.release_finished(&traversal, &mut allocations);
            if running == 0 {
                break;
            }

            let finished = self.backend.wait()?;
            running -= 1;
            match finished.outcome {
                Ok(outputs) => {
                    self.ui.completed(graph.node(finished.id).name());
                    traversal.complete(finished.id, outputs)?;
                }
                Err(e) => self.record_failure(&mut traversal, finished.id, e, &mut failures)?,
            }
        }

        debug_assert!(traversal.is_done());
        let counts = traversal.counts();
        log::info!(
            "{} of {} nodes completed, {} failed, {} skipped",
            counts.completed,
            counts.total(),
            counts.failed,
            counts.skipped
        );
        self.ui.print_elapsed("Run");
        Ok(RunReport::new(&traversal, failures, timer.elapsed()))
    }

    /// Allocate, bind, and submit one ready node.
    fn dispatch(&mut self, traversal: &Traversal, id: NodeId, allocations: &mut Allocations) -> Result<()> {
        let node = traversal.graph().node(id);
        let work_dir = self.work_dirs.allocate(node.subject(), node.step())?;
        allocations
            .dirs
            .entry(node.subject().to_owned())
            .or_default()
            .push(work_dir.clone());

        let inputs = node.bind(traversal.gather_inputs(id))?;
        self.ui.run(node.name(), &work_dir);
        self.backend.submit(Job {
            id,
            node: node.clone(),
            inputs,
            work_dir,
        })
    }

    fn record_failure(
        &self,
        traversal: &mut Traversal,
        id: NodeId,
        e: anyhow::Error,
        failures: &mut HashMap<NodeId, anyhow::Error>,
    ) -> Result<()> {
        let graph = traversal.graph();
        let name = graph.node(id).name();
        log::error!("{name}: {e:#}");
        self.ui.failed(name, &e);
        let skipped = traversal.fail(id)?;
        self.ui
            .skipped(&names(graph, &skipped), &format!("{name} failed"));
        failures.insert(id, e);
        Ok(())
    }

    /// Release the working directories of every subject whose nodes are all terminal.
    fn release_finished(&self, traversal: &Traversal, allocations: &mut Allocations) {
        for subject in traversal.graph().subjects() {
            if allocations.released.contains(subject) || !traversal.is_subject_done(subject) {
                continue;
            }
            let dirs = allocations.dirs.remove(subject).unwrap_or_default();
            let failed = traversal.subject_failed(subject);
            if let Err(e) = self.work_dirs.release_subject(subject, &dirs, failed) {
                log::error!("releasing working directories of {subject}: {e:#}");
            }
            allocations.released.insert(subject.to_owned());
        }
    }
}

fn names(graph: &Graph, ids: &[NodeId]) -> Vec<String> {
    ids.iter().map(|&id| graph.node(id).name().to_owned()).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::exec::{LocalBackend, Runtime};
    use crate::fs::{Fs, Retention};
    use graph::{Bindings, FunctionTask, NodeState, TaskNode, ValueType};
    use tempfile::tempdir;

    fn executor(dir: &std::path::Path, workers: usize) -> Result<Executor> {
        let fs = Fs::new([dir]);
        let rt = Runtime::new(fs.clone());
        let cancel = rt.cancel.clone();
        let backend = LocalBackend::new(workers, rt)?;
        let work_dirs = WorkDirs::new(dir, fs, Retention::Always);
        Ok(Executor::new(Box::new(backend), work_dirs, cancel, Ui::new(false)))
    }

    fn step(subject: &str, name: &str, fail: bool) -> TaskNode {
        TaskNode::function(
            subject,
            name,
            FunctionTask::new(move |inputs, _| {
                if fail {
                    anyhow::bail!("forced failure");
                }
                let n: usize = inputs.parse("n").unwrap_or(0);
                Ok(Bindings::new().with("n", (n + 1).to_string()))
            }),
        )
        .output("n", ValueType::Scalar)
    }

    #[test]
    fn test_chain_passes_values() -> Result<()> {
        let dir = tempdir()?;
        let mut g = Graph::new();
        let a = g.add_node(step("sub-01", "a", false))?;
        let b = g.add_node(step("sub-01", "b", false).input("n", ValueType::Scalar))?;
        let c = g.add_node(step("sub-01", "c", false).input("n", ValueType::Scalar))?;
        g.connect(a, "n", b, "n")?;
        g.connect(b, "n", c, "n")?;

        let report = executor(dir.path(), 2)?.run(&g)?;
        assert!(report.success());
        assert_eq!(report.state("sub-01.c"), Some(NodeState::Completed));
        assert!(dir.path().join("sub-01/c").is_dir());
        Ok(())
    }

    #[test]
    fn test_failure_isolated_to_subject() -> Result<()> {
        let dir = tempdir()?;
        let mut g = Graph::new();
        for (subject, fail) in [("sub-01", true), ("sub-02", false)] {
            let mut sg = Graph::new();
            let a = sg.add_node(step(subject, "a", fail))?;
            let b = sg.add_node(step(subject, "b", false).input("n", ValueType::Scalar))?;
            sg.connect(a, "n", b, "n")?;
            g = g.merge(sg)?;
        }

        let report = executor(dir.path(), 1)?.run(&g)?;
        assert!(!report.success());
        assert_eq!(report.state("sub-01.a"), Some(NodeState::Failed));
        assert_eq!(report.state("sub-01.b"), Some(NodeState::Skipped));
        assert_eq!(report.state("sub-02.b"), Some(NodeState::Completed));
        Ok(())
    }

    #[test]
    fn test_bind_failure_fails_node() -> Result<()> {
        let dir = tempdir()?;
        let mut g = Graph::new();
        // declared input with no edge and no constant:
        g.add_node(step("sub-01", "orphan", false).input("dwi", ValueType::File))?;
        let report = executor(dir.path(), 1)?.run(&g)?;
        assert_eq!(report.state("sub-01.orphan"), Some(NodeState::Failed));
        Ok(())
    }
}
