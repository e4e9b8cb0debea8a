//! Text-level parsers used to configure a pipeline run:
//! `{placeholder}` config templates (for the external tracking toolchain)
//! and `key=value` backend plugin arguments.

#[macro_use]
mod macros;
mod parse;
pub use parse::{parse_plugin_args, parse_template, Error as ParseError, Segment};

mod render;
pub use render::{render, render_file, Substitutions};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Template references undefined placeholder \"{0}\"")]
    UndefinedPlaceholder(String),
}

type Hasher = std::hash::BuildHasherDefault<rustc_hash::FxHasher>;
type HashMap<K, V> = std::collections::HashMap<K, V, Hasher>;
