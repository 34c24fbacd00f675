use regex::Regex;
use std::fmt;

use crate::error::{Error, Result};

/// Name of a reference stored under `refs/` in the repository
///
/// In [OCI distribution spec](https://github.com/opencontainers/distribution-spec/blob/main/spec.md):
/// > `<reference>` as a tag MUST be at most 128 characters
/// > in length and MUST match the following regular expression:
/// > ```text
/// > [a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}
/// > ```
/// This struct checks this restriction at creation, which also keeps
/// reference names from escaping the `refs/` directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefName(String);

lazy_static::lazy_static! {
    static ref REF_RE: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

impl RefName {
    pub fn new(name: &str) -> Result<Self> {
        if REF_RE.is_match(name) {
            Ok(RefName(name.to_string()))
        } else {
            Err(Error::InvalidReference(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
