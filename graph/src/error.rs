use std::path::PathBuf;

use crate::ValueType;

/// Errors raised while building a graph or binding values to its nodes.
///
/// Everything up to `CycleDetected` is a construction-time error: it means the
/// pipeline template itself is wrong, and no node should run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Node \"{0}\" already exists in graph")]
    DuplicateNode(String),
    #[error("Node \"{node}\" has no {direction} port named \"{port}\"")]
    UnknownPort {
        node: String,
        port: String,
        direction: &'static str,
    },
    #[error("Port \"{port}\" of node \"{node}\" expects a {expected}, but was given a {found}")]
    TypeMismatch {
        node: String,
        port: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("Input \"{port}\" of node \"{node}\" is already bound")]
    MultipleBinding { node: String, port: String },
    #[error("Dependency cycle detected among nodes: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
    #[error("Input \"{port}\" of node \"{node}\" has no bound value")]
    MissingInput { node: String, port: String },
    #[error(
        "Node \"{node}\" did not produce expected output \"{port}\"{}",
        .path.as_ref().map(|p| format!(" (no file at {})", p.display())).unwrap_or_default()
    )]
    MissingOutput {
        node: String,
        port: String,
        path: Option<PathBuf>,
    },
    #[error("No value bound for \"{0}\"")]
    Unbound(String),
    #[error("Value for \"{port}\" is a {found}, expected a {expected}")]
    WrongValueType {
        port: String,
        expected: ValueType,
        found: ValueType,
    },
}
