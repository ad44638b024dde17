//! Identifier validation for values that become path components.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-][A-Za-z0-9._-]*$").expect("id pattern should compile")
});

/// Validate a task id, agent id or guard name.
///
/// Ids are used verbatim as file and directory names, so they must be
/// `[A-Za-z0-9._-]` only and may not start with `.`.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/' (got '{id}')"));
    }
    if !ID_RE.is_match(id) {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        validate_id("task-42").expect("plain id");
        validate_id("agent_b.2").expect("dotted id");
    }

    #[test]
    fn rejects_slash() {
        let err = validate_id("bad/id").unwrap_err();
        assert!(err.to_string().contains("must not contain"));
    }

    #[test]
    fn rejects_hidden_and_empty() {
        assert!(validate_id(".hidden").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id("has space").is_err());
    }
}
