//! Typed task nodes and the dependency graph that connects them.
//!
//! A [`Graph`] is built once per subject from a fixed template of [`TaskNode`]s,
//! validated, and merged with the other subjects' graphs into one meta-graph.
//! Nothing in this crate runs anything; see the `traverse` crate for run state.

mod id;
pub use id::NodeId;

mod value;
pub use value::{Bindings, Value, ValueType};

mod task;
pub use task::{
    Body, CommandTask, FunctionTask, NodeState, OutputFile, Port, ResourceHints, TaskNode,
};

mod graph;
pub use graph::{Edge, Graph};

mod error;
pub use error::Error;
