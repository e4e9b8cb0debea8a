use std::path::Path;

use anyhow::{Context, Result};

use crate::parse::{parse_template, Segment};
use crate::{Error, HashMap};

/// Named values substituted verbatim into a config template.
#[derive(Debug, Default, Clone)]
pub struct Substitutions {
    values: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the value for `key`.
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, val: V) -> &mut Self {
        self.values.insert(key.into(), val.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Substitutions {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut subs = Self::new();
        for (k, v) in iter {
            subs.insert(k, v);
        }
        subs
    }
}

/// Substitute every `{key}` in `text`, failing on the first key
/// that has no value in `subs`.
pub fn render(text: &str, subs: &Substitutions) -> Result<String> {
    let segments = parse_template(text)?;
    let mut out = String::with_capacity(text.len() * 2);
    for segment in segments {
        match segment {
            Segment::Text(s) => out.push_str(s),
            Segment::Placeholder(key) => {
                let val = subs
                    .get(key)
                    .ok_or_else(|| Error::UndefinedPlaceholder(key.to_owned()))?;
                out.push_str(val);
            }
        }
    }
    Ok(out)
}

/// Read the template at `path` and render it.
pub fn render_file(path: &Path, subs: &Substitutions) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("while reading template {:?}", path))?;
    render(&text, subs).with_context(|| format!("while rendering template {:?}", path))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render() -> Result<()> {
        let subs: Substitutions = [("id", "01"), ("bval", "/x/01.bval")].into_iter().collect();
        assert_eq!("ID=01 BVAL=/x/01.bval", render("ID={id} BVAL={bval}", &subs)?);
        Ok(())
    }

    #[test]
    fn test_undefined_placeholder() {
        let subs: Substitutions = [("id", "01")].into_iter().collect();
        let e = render("ID={id} BVAL={bval}", &subs).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::UndefinedPlaceholder(key)) => assert_eq!(key, "bval"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_render_multiline() -> Result<()> {
        let subs: Substitutions = [("subjects", "sub-01"), ("niftis", "a.nii.gz b.nii.gz")]
            .into_iter()
            .collect();
        let text = "set subjlist = ({subjects})\nset dcmlist = ({niftis})\n";
        assert_eq!(
            "set subjlist = (sub-01)\nset dcmlist = (a.nii.gz b.nii.gz)\n",
            render(text, &subs)?
        );
        Ok(())
    }
}
