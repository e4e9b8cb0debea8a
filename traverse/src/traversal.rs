use std::collections::{BTreeSet, VecDeque};

use colored::Colorize;

use graph::{Bindings, Graph, NodeId, NodeState};
use util::IdVec;

use crate::Error;

/// Sort key for the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey<'a> {
    subject: usize,
    rank: usize,
    name: &'a str,
    id: NodeId,
}

/// Number of nodes in each state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Counts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed + self.skipped
    }
}

/// Mutable run state over an immutable graph.
pub struct Traversal<'a> {
    graph: &'a Graph,
    states: IdVec<NodeId, NodeState>,
    /// upstream nodes not yet completed
    waiting: IdVec<NodeId, usize>,
    outputs: IdVec<NodeId, Option<Bindings>>,
    keys: IdVec<NodeId, ReadyKey<'a>>,
    ready: BTreeSet<ReadyKey<'a>>,
}

impl<'a> Traversal<'a> {
    /// Validate `graph` and compute the initial ready set.
    pub fn new(graph: &'a Graph) -> Result<Self, graph::Error> {
        let ranks = graph.ranks()?;
        let subjects = graph.subjects();
        let len = graph.len();

        let mut traversal = Self {
            graph,
            states: IdVec::fill(NodeState::Pending, len),
            waiting: IdVec::with_capacity(len),
            outputs: IdVec::fill(None, len),
            keys: IdVec::with_capacity(len),
            ready: BTreeSet::new(),
        };

        for (id, node) in graph.nodes() {
            let subject = subjects
                .iter()
                .position(|s| *s == node.subject())
                .unwrap_or(subjects.len());
            traversal.keys.push(ReadyKey {
                subject,
                rank: *ranks.get(id),
                name: node.name(),
                id,
            });
            traversal.waiting.push(graph.dependencies(id).len());
        }

        for id in graph.ids() {
            if *traversal.waiting.get(id) == 0 {
                traversal.make_ready(id);
            }
        }

        log::debug!(
            "created traversal over {} nodes, {} initially ready",
            len,
            traversal.ready.len()
        );
        Ok(traversal)
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        *self.states.get(id)
    }

    /// All node states in id order.
    pub fn states(&self) -> impl Iterator<Item = (NodeId, NodeState)> + '_ {
        self.states.iter_ids().map(|(id, state)| (id, *state))
    }

    /// Outputs of a completed node.
    pub fn outputs(&self, id: NodeId) -> Option<&Bindings> {
        self.outputs.get(id).as_ref()
    }

    /// True iff every upstream node of `id` is `Completed`.
    pub fn is_ready(&self, id: NodeId) -> bool {
        self.graph
            .dependencies(id)
            .into_iter()
            .all(|dep| self.state(dep) == NodeState::Completed)
    }

    /// Remove and return the first ready node in scheduling order.
    /// The node stays `Ready` until it is started or failed.
    pub fn next_ready(&mut self) -> Option<NodeId> {
        self.ready.pop_first().map(|key| key.id)
    }

    /// Values produced upstream for every input edge of `id`.
    /// Ports whose upstream value is missing are left unbound, so that
    /// binding reports them.
    pub fn gather_inputs(&self, id: NodeId) -> Bindings {
        let mut inputs = Bindings::new();
        for edge in self.graph.incoming(id) {
            let val = self
                .outputs(edge.src)
                .and_then(|outputs| outputs.get(&edge.src_port));
            if let Some(val) = val {
                inputs.insert(edge.dst_port.as_str(), val.clone());
            }
        }
        inputs
    }

    pub fn start(&mut self, id: NodeId) -> Result<(), Error> {
        self.transition(id, NodeState::Running)?;
        self.ready.remove(self.keys.get(id));
        Ok(())
    }

    /// Record `outputs` and promote dependents whose upstream nodes are all complete.
    /// Returns the newly ready nodes.
    pub fn complete(&mut self, id: NodeId, outputs: Bindings) -> Result<Vec<NodeId>, Error> {
        self.transition(id, NodeState::Completed)?;
        *self.outputs.get_mut(id) = Some(outputs);

        let mut promoted = Vec::with_capacity(4);
        for dep in self.graph.dependents(id) {
            let waiting = self.waiting.get_mut(dep);
            *waiting -= 1;
            if *waiting == 0 && self.state(dep) == NodeState::Pending {
                self.make_ready(dep);
                promoted.push(dep);
            }
        }
        Ok(promoted)
    }

    /// Mark `id` failed and skip every non-terminal node downstream of it.
    /// Returns the skipped nodes.
    pub fn fail(&mut self, id: NodeId) -> Result<Vec<NodeId>, Error> {
        if self.state(id) == NodeState::Ready {
            self.ready.remove(self.keys.get(id));
        }
        self.transition(id, NodeState::Failed)?;

        let mut skipped = Vec::with_capacity(8);
        let mut queue: VecDeque<NodeId> = self.graph.dependents(id).into();
        while let Some(dep) = queue.pop_front() {
            if self.state(dep).is_terminal() {
                continue;
            }
            self.skip(dep)?;
            skipped.push(dep);
            queue.extend(self.graph.dependents(dep));
        }

        for &dep in &skipped {
            log::debug!(
                "{} skipped: upstream {} failed",
                self.graph.node(dep).name().yellow(),
                self.graph.node(id).name(),
            );
        }
        Ok(skipped)
    }

    /// Skip every `Pending` or `Ready` node. Running nodes are left to finish or be killed.
    pub fn cancel_pending(&mut self) -> Result<Vec<NodeId>, Error> {
        let to_skip: Vec<NodeId> = self
            .states()
            .filter(|(_, state)| matches!(state, NodeState::Pending | NodeState::Ready))
            .map(|(id, _)| id)
            .collect();
        for &id in &to_skip {
            self.skip(id)?;
        }
        Ok(to_skip)
    }

    /// True once every node has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.states.iter().all(|state| state.is_terminal())
    }

    /// True once every node belonging to `subject` has reached a terminal state.
    pub fn is_subject_done(&self, subject: &str) -> bool {
        self.graph
            .nodes()
            .filter(|(_, node)| node.subject() == subject)
            .all(|(id, _)| self.state(id).is_terminal())
    }

    /// True if any node of `subject` failed.
    pub fn subject_failed(&self, subject: &str) -> bool {
        self.graph
            .nodes()
            .any(|(id, node)| node.subject() == subject && self.state(id) == NodeState::Failed)
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for state in self.states.iter() {
            match state {
                NodeState::Pending => counts.pending += 1,
                NodeState::Ready => counts.ready += 1,
                NodeState::Running => counts.running += 1,
                NodeState::Completed => counts.completed += 1,
                NodeState::Failed => counts.failed += 1,
                NodeState::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    fn skip(&mut self, id: NodeId) -> Result<(), Error> {
        if self.state(id) == NodeState::Ready {
            self.ready.remove(self.keys.get(id));
        }
        self.transition(id, NodeState::Skipped)
    }

    fn make_ready(&mut self, id: NodeId) {
        *self.states.get_mut(id) = NodeState::Ready;
        self.ready.insert(*self.keys.get(id));
    }

    fn transition(&mut self, id: NodeId, to: NodeState) -> Result<(), Error> {
        let from = self.state(id);
        if !from.can_become(to) {
            return Err(Error::InvalidTransition {
                node: self.graph.node(id).name().to_owned(),
                from,
                to,
            });
        }
        log::trace!("{}: {from} -> {to}", self.graph.node(id).name());
        *self.states.get_mut(id) = to;
        Ok(())
    }
}
