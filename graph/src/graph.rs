use std::collections::VecDeque;

use util::{HashMap, IdVec};

use crate::{Error, NodeId, TaskNode};

/// A typed data-flow edge: `src.src_port -> dst.dst_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub src: NodeId,
    pub src_port: String,
    pub dst: NodeId,
    pub dst_port: String,
}

/// A set of task nodes and the typed edges between them.
/// Nodes and edges are never removed once added.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: IdVec<NodeId, TaskNode>,
    names: HashMap<String, NodeId>,
    edges: Vec<Edge>,
    // edge indices per node:
    incoming: IdVec<NodeId, Vec<usize>>,
    outgoing: IdVec<NodeId, Vec<usize>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node`, failing if a node with the same name already exists.
    pub fn add_node(&mut self, node: TaskNode) -> Result<NodeId, Error> {
        if self.names.contains_key(node.name()) {
            return Err(Error::DuplicateNode(node.name().to_owned()));
        }
        let name = node.name().to_owned();
        let id = self.nodes.push(node);
        self.incoming.push(Vec::with_capacity(4));
        self.outgoing.push(Vec::with_capacity(4));
        self.names.insert(name, id);
        log::trace!("added node {} {}", id, self.nodes.get(id).name());
        Ok(id)
    }

    /// Connect an output port of `src` to an input port of `dst`.
    pub fn connect(
        &mut self,
        src: NodeId,
        src_port: &str,
        dst: NodeId,
        dst_port: &str,
    ) -> Result<(), Error> {
        let src_node = self.nodes.get(src);
        let dst_node = self.nodes.get(dst);

        let src_ty = src_node
            .output_type(src_port)
            .ok_or_else(|| Error::UnknownPort {
                node: src_node.name().to_owned(),
                port: src_port.to_owned(),
                direction: "output",
            })?;
        let dst_ty = dst_node
            .input_type(dst_port)
            .ok_or_else(|| Error::UnknownPort {
                node: dst_node.name().to_owned(),
                port: dst_port.to_owned(),
                direction: "input",
            })?;

        if src_ty != dst_ty {
            return Err(Error::TypeMismatch {
                node: dst_node.name().to_owned(),
                port: dst_port.to_owned(),
                expected: dst_ty,
                found: src_ty,
            });
        }

        let already_bound = dst_node.is_constant(dst_port)
            || self
                .incoming
                .get(dst)
                .iter()
                .any(|&e| self.edges[e].dst_port == dst_port);
        if already_bound {
            return Err(Error::MultipleBinding {
                node: dst_node.name().to_owned(),
                port: dst_port.to_owned(),
            });
        }

        let idx = self.edges.len();
        self.edges.push(Edge {
            src,
            src_port: src_port.to_owned(),
            dst,
            dst_port: dst_port.to_owned(),
        });
        self.outgoing.get_mut(src).push(idx);
        self.incoming.get_mut(dst).push(idx);
        Ok(())
    }

    /// Topologically sort the graph.
    /// Fails with `CycleDetected` naming every node that lies on a cycle.
    pub fn validate(&self) -> Result<Vec<NodeId>, Error> {
        let mut in_degree: IdVec<NodeId, usize> = IdVec::fill(0, self.nodes.len());
        for id in self.nodes.ids() {
            *in_degree.get_mut(id) = self.dependencies(id).len();
        }

        let mut queue: VecDeque<NodeId> =
            self.nodes.ids().filter(|&id| *in_degree.get(id) == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for dep in self.dependents(id) {
                let n = in_degree.get_mut(dep);
                *n -= 1;
                if *n == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        // Nodes left over are on a cycle, or between or downstream of cycles.
        // Only the ones that can reach themselves are cycle members.
        let mut remaining: IdVec<NodeId, bool> = IdVec::fill(false, self.nodes.len());
        for (id, n) in in_degree.iter_ids() {
            if *n > 0 {
                *remaining.get_mut(id) = true;
            }
        }
        let on_cycle: Vec<NodeId> = self
            .nodes
            .ids()
            .filter(|&id| *remaining.get(id) && self.reaches_itself(id, &remaining))
            .collect();
        let mut remaining: IdVec<NodeId, bool> = IdVec::fill(false, self.nodes.len());
        for id in on_cycle {
            *remaining.get_mut(id) = true;
        }
        let mut names: Vec<String> = remaining
            .iter_ids()
            .filter(|(_, on_cycle)| **on_cycle)
            .map(|(id, _)| self.nodes.get(id).name().to_owned())
            .collect();
        names.sort();
        Err(Error::CycleDetected(names))
    }

    /// True if a path of `within` nodes leads from `start` back to itself.
    fn reaches_itself(&self, start: NodeId, within: &IdVec<NodeId, bool>) -> bool {
        let mut seen: IdVec<NodeId, bool> = IdVec::fill(false, self.nodes.len());
        let mut stack = self.dependents(start);
        while let Some(id) = stack.pop() {
            if id == start {
                return true;
            }
            if !*within.get(id) || *seen.get(id) {
                continue;
            }
            *seen.get_mut(id) = true;
            stack.extend(self.dependents(id));
        }
        false
    }

    /// Combine two graphs without adding any edge between them.
    pub fn merge(mut self, other: Graph) -> Result<Graph, Error> {
        let offset = self.nodes.len();
        let edges = other.edges;
        for node in other.nodes.into_inner() {
            self.add_node(node)?;
        }
        for edge in edges {
            let src = NodeId::from(usize::from(edge.src) + offset);
            let dst = NodeId::from(usize::from(edge.dst) + offset);
            let idx = self.edges.len();
            self.edges.push(Edge { src, dst, ..edge });
            self.outgoing.get_mut(src).push(idx);
            self.incoming.get_mut(dst).push(idx);
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &TaskNode {
        self.nodes.get(id)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.ids()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &TaskNode)> {
        self.nodes.iter_ids()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges feeding `id`'s input ports.
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming.get(id).iter().map(|&e| &self.edges[e])
    }

    /// Distinct upstream nodes of `id`, in id order.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self.incoming(id).map(|e| e.src).collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Distinct downstream nodes of `id`, in id order.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self
            .outgoing
            .get(id)
            .iter()
            .map(|&e| self.edges[e].dst)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Longest-path depth of every node from the roots. Assumes the graph is acyclic.
    pub fn ranks(&self) -> Result<IdVec<NodeId, usize>, Error> {
        let order = self.validate()?;
        let mut ranks = IdVec::fill(0, self.nodes.len());
        for id in order {
            let rank = self
                .dependencies(id)
                .into_iter()
                .map(|dep| *ranks.get(dep) + 1)
                .max()
                .unwrap_or(0);
            *ranks.get_mut(id) = rank;
        }
        Ok(ranks)
    }

    /// Subjects in the order their first node was registered.
    pub fn subjects(&self) -> Vec<&str> {
        let mut subjects: Vec<&str> = Vec::with_capacity(8);
        for node in self.nodes.iter() {
            if !subjects.contains(&node.subject()) {
                subjects.push(node.subject());
            }
        }
        subjects
    }
}
