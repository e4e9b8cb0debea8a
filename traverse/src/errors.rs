use colored::Colorize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} failed due to {1} errors")]
    AggregatedErrors(String, usize),
}

/// Collects errors that shouldn't stop work on unrelated items
/// (e.g. one subject's missing metadata), to be reported together.
pub struct Errors {
    errors: Vec<anyhow::Error>,
}

impl Default for Errors {
    fn default() -> Self {
        Self {
            errors: Vec::with_capacity(0),
        }
    }
}

impl Errors {
    pub fn add_context(&mut self, e: anyhow::Error, msg: String) {
        log::trace!("{msg}: {e:?}");
        self.errors.push(e.context(msg));
    }

    pub fn add(&mut self, e: anyhow::Error) {
        log::trace!("error: {e:?}");
        self.errors.push(e);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Print full list of errors to stderr, fail w/ an aggregated error
    /// if there were one or more errors.
    pub fn print_recap(&self, label: &str) -> Result<(), Error> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            eprintln!("\nEncountered errors while {label}:\n");
            for e in &self.errors {
                eprintln!("{}: {e:?}\n", "ERROR".red());
            }
            Err(Error::AggregatedErrors(label.to_owned(), self.errors.len()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_recap() {
        let mut errors = Errors::default();
        assert!(errors.print_recap("discovering subjects").is_ok());
        errors.add_context(anyhow::anyhow!("no sidecar"), "sub-01".to_owned());
        errors.add(anyhow::anyhow!("no volumes"));
        assert_eq!(errors.len(), 2);
        let e = errors.print_recap("discovering subjects").unwrap_err();
        assert_eq!(e.to_string(), "discovering subjects failed due to 2 errors");
    }
}
