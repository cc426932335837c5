use regex::{Regex, RegexBuilder};

use crate::core::error::{SupervisorError, SupervisorResult};

/// Case-insensitive failure patterns tested against each captured line.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    patterns: Vec<Regex>,
}

impl SignatureSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> SupervisorResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        SupervisorError::Config(format!(
                            "bad signature '{}': {}",
                            p.as_ref(),
                            e
                        ))
                    })
            })
            .collect::<SupervisorResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
