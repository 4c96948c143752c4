//! Regular expressions matched against console lines.

use std::fmt;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

/// Result type for pattern compilation.
pub type PatternResult<T> = Result<T, PatternError>;

/// A console pattern failed to compile.
#[derive(Debug, thiserror::Error)]
#[error("Invalid console pattern '{pattern}': {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// The on-disk form of a pattern: `{regex: "..."}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PatternSpec {
    pub regex: String,
}

/// A compiled regex searched anywhere in a single console line.
///
/// Lines are raw bytes: consoles routinely emit garbage during boot.
#[derive(Clone, Deserialize, Serialize)]
#[serde(try_from = "PatternSpec", into = "PatternSpec")]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    pub fn new(pattern: &str) -> PatternResult<Self> {
        let regex = Regex::new(pattern).map_err(|source| PatternError {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, line: &[u8]) -> bool {
        self.regex.is_match(line)
    }
}

impl TryFrom<PatternSpec> for Pattern {
    type Error = PatternError;

    fn try_from(spec: PatternSpec) -> Result<Self, Self::Error> {
        Pattern::new(&spec.regex)
    }
}

impl From<Pattern> for PatternSpec {
    fn from(pattern: Pattern) -> Self {
        PatternSpec {
            regex: pattern.as_str().to_string(),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}
