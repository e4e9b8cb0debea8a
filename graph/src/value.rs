use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;

use crate::Error;

/// The type carried by a port.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ValueType {
    File,
    FileList,
    Scalar,
    ScalarList,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::File => "file",
            Self::FileList => "file list",
            Self::Scalar => "scalar",
            Self::ScalarList => "scalar list",
        };
        f.write_str(s)
    }
}

/// A concrete value flowing along an edge, or bound as a constant.
/// Scalars are kept as text; bodies parse them as needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    File(PathBuf),
    FileList(Vec<PathBuf>),
    Scalar(String),
    ScalarList(Vec<String>),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Self::File(_) => ValueType::File,
            Self::FileList(_) => ValueType::FileList,
            Self::Scalar(_) => ValueType::Scalar,
            Self::ScalarList(_) => ValueType::ScalarList,
        }
    }

    /// Create a scalar from anything printable.
    pub fn scalar<T: fmt::Display>(val: T) -> Self {
        Self::Scalar(val.to_string())
    }

    /// All file paths referenced by this value (empty for scalars).
    pub fn files(&self) -> Vec<&Path> {
        match self {
            Self::File(path) => vec![path.as_path()],
            Self::FileList(paths) => paths.iter().map(PathBuf::as_path).collect(),
            Self::Scalar(_) | Self::ScalarList(_) => Vec::with_capacity(0),
        }
    }
}

impl From<PathBuf> for Value {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for Value {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<Vec<PathBuf>> for Value {
    fn from(paths: Vec<PathBuf>) -> Self {
        Self::FileList(paths)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Scalar(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Scalar(s.to_owned())
    }
}

impl From<Vec<String>> for Value {
    fn from(vals: Vec<String>) -> Self {
        Self::ScalarList(vals)
    }
}

/// Values keyed by port name: the inputs bound to a node, or the outputs it produced.
/// Ordered so that anything derived from bindings (command lines, logs) is reproducible.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, port: K, val: V) -> Self {
        self.insert(port, val);
        self
    }

    /// Insert a value, returning the value previously bound to `port` if any.
    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, port: K, val: V) -> Option<Value> {
        self.values.insert(port.into(), val.into())
    }

    pub fn get(&self, port: &str) -> Option<&Value> {
        self.values.get(port)
    }

    pub fn contains(&self, port: &str) -> bool {
        self.values.contains_key(port)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, port: &str) -> Result<&Value, Error> {
        self.values
            .get(port)
            .ok_or_else(|| Error::Unbound(port.to_owned()))
    }

    fn wrong_type(port: &str, expected: ValueType, found: &Value) -> Error {
        Error::WrongValueType {
            port: port.to_owned(),
            expected,
            found: found.ty(),
        }
    }

    pub fn file(&self, port: &str) -> Result<&Path, Error> {
        match self.require(port)? {
            Value::File(path) => Ok(path.as_path()),
            other => Err(Self::wrong_type(port, ValueType::File, other)),
        }
    }

    pub fn files(&self, port: &str) -> Result<&[PathBuf], Error> {
        match self.require(port)? {
            Value::FileList(paths) => Ok(paths.as_slice()),
            other => Err(Self::wrong_type(port, ValueType::FileList, other)),
        }
    }

    pub fn scalar(&self, port: &str) -> Result<&str, Error> {
        match self.require(port)? {
            Value::Scalar(s) => Ok(s.as_str()),
            other => Err(Self::wrong_type(port, ValueType::Scalar, other)),
        }
    }

    pub fn scalars(&self, port: &str) -> Result<&[String], Error> {
        match self.require(port)? {
            Value::ScalarList(vals) => Ok(vals.as_slice()),
            other => Err(Self::wrong_type(port, ValueType::ScalarList, other)),
        }
    }

    /// Parse a scalar into `T`.
    pub fn parse<T>(&self, port: &str) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let s = self.scalar(port)?;
        s.parse()
            .with_context(|| format!("while parsing \"{port}\" value {s:?}"))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Bindings {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut bindings = Self::new();
        for (k, v) in iter {
            bindings.insert(k, v);
        }
        bindings
    }
}
