use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::{Bindings, Error, Value, ValueType};

/// Lifecycle of a node within one run. States only move forward.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// True if moving from `self` to `next` is a legal forward transition.
    pub fn can_become(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Failed)
                | (Ready, Skipped)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// A named, typed input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub ty: ValueType,
}

/// Hints for the execution backend. They never change graph semantics;
/// a backend is free to ignore any it doesn't understand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHints {
    /// CPU threads the body may use.
    pub threads: Option<usize>,
    /// Memory in gigabytes.
    pub memory_gb: Option<usize>,
    /// Batch queue/partition name.
    pub queue: Option<String>,
    /// Overrides the backend's default per-node timeout.
    pub timeout: Option<Duration>,
    /// Opaque backend-specific arguments (e.g. `--gres=gpu:1` for Slurm).
    pub extra: Vec<String>,
}

impl ResourceHints {
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    pub fn memory_gb(mut self, gb: usize) -> Self {
        self.memory_gb = Some(gb);
        self
    }

    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn extra<S: Into<String>>(mut self, arg: S) -> Self {
        self.extra.push(arg.into());
        self
    }
}

type TaskFn = dyn Fn(&Bindings, &Path) -> Result<Bindings> + Send + Sync;
type RenderFn = dyn Fn(&Bindings) -> Result<Vec<String>> + Send + Sync;

/// An in-process transformation over bound inputs.
/// The function receives the node's working directory and may create files there.
#[derive(Clone)]
pub struct FunctionTask {
    func: Arc<TaskFn>,
}

impl FunctionTask {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Bindings, &Path) -> Result<Bindings> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    pub fn call(&self, inputs: &Bindings, work_dir: &Path) -> Result<Bindings> {
        (self.func)(inputs, work_dir)
    }
}

impl fmt::Debug for FunctionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FunctionTask")
    }
}

/// Where a command leaves one of its declared output files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFile {
    /// Relative to the node's working directory.
    WorkDir(PathBuf),
    /// Fixed when the graph is built (for tools that write into their own tree).
    Absolute(PathBuf),
}

impl OutputFile {
    pub fn resolve(&self, work_dir: &Path) -> PathBuf {
        match self {
            Self::WorkDir(rel) => work_dir.join(rel),
            Self::Absolute(path) => path.clone(),
        }
    }
}

/// An external program invocation.
/// Argument rendering is a function of the bound inputs only.
#[derive(Clone)]
pub struct CommandTask {
    program: String,
    render: Arc<RenderFn>,
    outputs: Vec<(String, OutputFile)>,
    stale: Vec<PathBuf>,
}

impl CommandTask {
    pub fn new<S, F>(program: S, render: F) -> Self
    where
        S: Into<String>,
        F: Fn(&Bindings) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self {
            program: program.into(),
            render: Arc::new(render),
            outputs: Vec::with_capacity(4),
            stale: Vec::with_capacity(0),
        }
    }

    /// Declare an output file, exposed on the output port `port`.
    pub fn output<S: Into<String>>(mut self, port: S, file: OutputFile) -> Self {
        self.outputs.push((port.into(), file));
        self
    }

    /// Remove `path` (file or directory) before each run, for tools that
    /// refuse to overwrite earlier results.
    pub fn clear_before_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.stale.push(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn render_args(&self, inputs: &Bindings) -> Result<Vec<String>> {
        (self.render)(inputs)
    }

    pub fn outputs(&self) -> &[(String, OutputFile)] {
        &self.outputs
    }

    pub fn stale_paths(&self) -> &[PathBuf] {
        &self.stale
    }

    /// Read declared output files from disk into output bindings.
    pub fn collect_outputs(&self, node: &str, work_dir: &Path) -> Result<Bindings, Error> {
        let mut outputs = Bindings::new();
        for (port, file) in &self.outputs {
            let path = file.resolve(work_dir);
            if !(path.exists() || path.is_symlink()) {
                return Err(Error::MissingOutput {
                    node: node.to_owned(),
                    port: port.clone(),
                    path: Some(path),
                });
            }
            outputs.insert(port.as_str(), path);
        }
        Ok(outputs)
    }
}

impl fmt::Debug for CommandTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTask")
            .field("program", &self.program)
            .field("outputs", &self.outputs)
            .field("stale", &self.stale)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Function(FunctionTask),
    Command(CommandTask),
}

/// A unit of pipeline work with typed input and output ports.
#[derive(Debug, Clone)]
pub struct TaskNode {
    subject: String,
    step: String,
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    constants: Bindings,
    body: Body,
    hints: ResourceHints,
}

impl TaskNode {
    fn new(subject: &str, step: &str, body: Body) -> Self {
        let name = if subject.is_empty() {
            step.to_owned()
        } else {
            format!("{subject}.{step}")
        };
        Self {
            subject: subject.to_owned(),
            step: step.to_owned(),
            name,
            inputs: Vec::with_capacity(8),
            outputs: Vec::with_capacity(4),
            constants: Bindings::new(),
            body,
            hints: ResourceHints::default(),
        }
    }

    /// New node with an in-process body. Ports are declared with
    /// [`TaskNode::input`] and [`TaskNode::output`].
    pub fn function(subject: &str, step: &str, func: FunctionTask) -> Self {
        Self::new(subject, step, Body::Function(func))
    }

    /// New node running an external command.
    /// Each declared output file of `cmd` becomes a `File` output port.
    pub fn command(subject: &str, step: &str, cmd: CommandTask) -> Self {
        let ports: Vec<_> = cmd.outputs().iter().map(|(port, _)| port.clone()).collect();
        let mut node = Self::new(subject, step, Body::Command(cmd));
        for port in ports {
            node = node.output(port, ValueType::File);
        }
        node
    }

    pub fn input<S: Into<String>>(mut self, name: S, ty: ValueType) -> Self {
        self.inputs.push(Port {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn output<S: Into<String>>(mut self, name: S, ty: ValueType) -> Self {
        self.outputs.push(Port {
            name: name.into(),
            ty,
        });
        self
    }

    /// Bind an input directly to a subject-level value.
    /// Declares the input port (with the value's type) if it doesn't exist yet.
    pub fn constant<S: Into<String>, V: Into<Value>>(mut self, name: S, val: V) -> Self {
        let name = name.into();
        let val = val.into();
        if self.input_type(&name).is_none() {
            self = self.input(name.clone(), val.ty());
        }
        self.constants.insert(name, val);
        self
    }

    pub fn hints(mut self, hints: ResourceHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    pub fn constants(&self) -> &Bindings {
        &self.constants
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn resource_hints(&self) -> &ResourceHints {
        &self.hints
    }

    pub fn input_type(&self, port: &str) -> Option<ValueType> {
        self.inputs.iter().find(|p| p.name == port).map(|p| p.ty)
    }

    pub fn output_type(&self, port: &str) -> Option<ValueType> {
        self.outputs.iter().find(|p| p.name == port).map(|p| p.ty)
    }

    pub fn is_constant(&self, port: &str) -> bool {
        self.constants.contains(port)
    }

    /// Combine constants with `upstream` values and check that every
    /// declared input has a value of the declared type.
    pub fn bind(&self, upstream: Bindings) -> Result<Bindings, Error> {
        let mut bound = upstream;
        for (port, val) in self.constants.iter() {
            bound.insert(port, val.clone());
        }
        for port in &self.inputs {
            match bound.get(&port.name) {
                None => {
                    return Err(Error::MissingInput {
                        node: self.name.clone(),
                        port: port.name.clone(),
                    })
                }
                Some(val) if val.ty() != port.ty => {
                    return Err(Error::TypeMismatch {
                        node: self.name.clone(),
                        port: port.name.clone(),
                        expected: port.ty,
                        found: val.ty(),
                    })
                }
                Some(_) => (),
            }
        }
        Ok(bound)
    }

    /// Check that `produced` has a correctly-typed value for every declared output.
    pub fn check_outputs(&self, produced: &Bindings) -> Result<(), Error> {
        for port in &self.outputs {
            match produced.get(&port.name) {
                None => {
                    return Err(Error::MissingOutput {
                        node: self.name.clone(),
                        port: port.name.clone(),
                        path: None,
                    })
                }
                Some(val) if val.ty() != port.ty => {
                    return Err(Error::TypeMismatch {
                        node: self.name.clone(),
                        port: port.name.clone(),
                        expected: port.ty,
                        found: val.ty(),
                    })
                }
                Some(_) => (),
            }
        }
        Ok(())
    }
}
