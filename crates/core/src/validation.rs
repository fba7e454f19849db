use regex::Regex;
use std::sync::OnceLock;

use crate::error::{CoreError, Result};

pub const MAX_CLUSTER_NAME_LENGTH: usize = 25;

static CLUSTER_NAME: OnceLock<Option<Regex>> = OnceLock::new();

fn cluster_name_pattern() -> Option<&'static Regex> {
    CLUSTER_NAME
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").ok())
        .as_ref()
}

pub fn is_valid_cluster_name(name: &str) -> bool {
    name.len() <= MAX_CLUSTER_NAME_LENGTH
        && cluster_name_pattern().is_some_and(|re| re.is_match(name))
}

pub fn validate_cluster_name(name: &str) -> Result<()> {
    if is_valid_cluster_name(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidClusterName(name.to_string()))
    }
}
