use std::time::Duration;

use colored::Colorize;

use graph::{NodeId, NodeState};
use traverse::Traversal;
use util::HashMap;

use super::{Captured, Error};

/// Final state of one node after a run.
#[derive(Debug)]
pub struct NodeReport {
    pub subject: String,
    pub name: String,
    pub state: NodeState,
    /// error chain, for failed nodes
    pub error: Option<String>,
    /// exit code and output tails, for failed commands
    pub captured: Option<Captured>,
}

/// Outcome of a whole run, in node registration order.
#[derive(Debug)]
pub struct RunReport {
    pub nodes: Vec<NodeReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn new(
        traversal: &Traversal,
        mut failures: HashMap<NodeId, anyhow::Error>,
        elapsed: Duration,
    ) -> Self {
        let graph = traversal.graph();
        let nodes = traversal
            .states()
            .map(|(id, state)| {
                let node = graph.node(id);
                let failure = failures.remove(&id);
                let captured = failure.as_ref().and_then(|e| match e.downcast_ref::<Error>() {
                    Some(Error::TaskExecution { captured, .. }) => captured.clone(),
                    _ => None,
                });
                NodeReport {
                    subject: node.subject().to_owned(),
                    name: node.name().to_owned(),
                    state,
                    error: failure.map(|e| format!("{e:#}")),
                    captured,
                }
            })
            .collect();
        Self { nodes, elapsed }
    }

    /// True if no node failed. Nodes skipped by cancellation also count against success.
    pub fn success(&self) -> bool {
        self.nodes.iter().all(|n| n.state == NodeState::Completed)
    }

    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.state)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    /// Subjects in the order their first node appears.
    pub fn subjects(&self) -> Vec<&str> {
        let mut subjects: Vec<&str> = Vec::new();
        for n in &self.nodes {
            if !subjects.contains(&n.subject.as_str()) {
                subjects.push(&n.subject);
            }
        }
        subjects
    }

    /// Print a per-subject summary to stderr.
    pub fn print(&self) {
        eprintln!(
            "\n{} {} nodes in {:.1}s: {} completed, {} failed, {} skipped",
            "Summary:".bold(),
            self.nodes.len(),
            self.elapsed.as_secs_f64(),
            self.count(NodeState::Completed),
            self.count(NodeState::Failed),
            self.count(NodeState::Skipped),
        );
        for subject in self.subjects() {
            let nodes: Vec<&NodeReport> = self.nodes.iter().filter(|n| n.subject == subject).collect();
            let failed = nodes.iter().any(|n| n.state == NodeState::Failed);
            let label = if subject.is_empty() { "(shared)" } else { subject };
            if failed {
                eprintln!("{} {}", label.bold(), "FAILED".red());
            } else if nodes.iter().all(|n| n.state == NodeState::Completed) {
                eprintln!("{} {}", label.bold(), "OK".green());
            } else {
                eprintln!("{} {}", label.bold(), "INCOMPLETE".yellow());
            }
            for n in nodes.iter().filter(|n| n.state != NodeState::Completed) {
                print_node(n);
            }
        }
    }
}

fn print_node(n: &NodeReport) {
    let state = match n.state {
        NodeState::Failed => n.state.to_string().red(),
        _ => n.state.to_string().yellow(),
    };
    eprintln!("  {state} {}", n.name);
    if let Some(error) = &n.error {
        eprintln!("    {error}");
    }
    if let Some(captured) = &n.captured {
        if let Some(code) = captured.code {
            eprintln!("    exit code: {code}");
        }
        print_tail("stdout", &captured.stdout);
        print_tail("stderr", &captured.stderr);
    }
}

fn print_tail(label: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    eprintln!("    {label}:");
    for line in text.lines() {
        eprintln!("      {line}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;
    use graph::{Bindings, FunctionTask, Graph, TaskNode};

    fn node(subject: &str, step: &str) -> TaskNode {
        TaskNode::function(subject, step, FunctionTask::new(|_, _| Ok(Bindings::new())))
    }

    #[test]
    fn test_report_collects_failure_details() -> Result<()> {
        let mut g = Graph::new();
        let a = g.add_node(node("sub-01", "eddy"))?;
        let b = g.add_node(node("sub-02", "eddy"))?;
        let mut t = Traversal::new(&g)?;
        for id in [a, b] {
            t.start(id)?;
        }
        t.complete(b, Bindings::new())?;
        t.fail(a)?;

        let mut failures = HashMap::default();
        failures.insert(
            a,
            anyhow::Error::new(Error::TaskExecution {
                node: "sub-01.eddy".to_owned(),
                cause: "eddy_openmp exited with 1".to_owned(),
                captured: Some(Captured {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "out of memory".to_owned(),
                }),
            }),
        );

        let report = RunReport::new(&t, failures, Duration::from_secs(3));
        assert!(!report.success());
        assert_eq!(report.subjects(), vec!["sub-01", "sub-02"]);
        assert_eq!(report.state("sub-02.eddy"), Some(NodeState::Completed));
        let failed = &report.nodes[0];
        assert!(failed.error.as_deref().is_some_and(|e| e.contains("exited with 1")));
        assert_eq!(failed.captured.as_ref().and_then(|c| c.code), Some(1));
        Ok(())
    }
}
