//! Input validation shared by the connector version registry and the
//! connection lifecycle.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

static NAMESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").expect("namespace pattern compiles")
});

static LABEL_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9_.-]{0,61}[a-z0-9])?$").expect("label key pattern compiles")
});

const MAX_NAMESPACE_LEN: usize = 255;
const MAX_LABEL_VALUE_LEN: usize = 255;

/// Dot-separated path such as `root` or `root.team-a`.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.len() > MAX_NAMESPACE_LEN || !NAMESPACE_RE.is_match(namespace) {
        return Err(Error::Validation(format!(
            "invalid namespace '{}'",
            namespace
        )));
    }
    Ok(())
}

pub fn validate_labels(labels: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in labels {
        if !LABEL_KEY_RE.is_match(key) {
            return Err(Error::Validation(format!("invalid label key '{}'", key)));
        }
        if value.len() > MAX_LABEL_VALUE_LEN {
            return Err(Error::Validation(format!(
                "label '{}' value exceeds {} bytes",
                key, MAX_LABEL_VALUE_LEN
            )));
        }
    }
    Ok(())
}
