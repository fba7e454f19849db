use std::collections::HashSet;

use cluster_core::NodeRole;
use rand::Rng;

use crate::error::{OrchestratorError, Result};

const SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 4;
/// Random draws allowed per requested name before giving up.
const ATTEMPTS_PER_NAME: usize = 64;

fn name_space() -> usize {
    SUFFIX_CHARS.len().pow(SUFFIX_LEN as u32)
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARS[rng.gen_range(0..SUFFIX_CHARS.len())] as char)
        .collect()
}

/// `count` fresh `<prefix>-xxxx` names, unique against `existing` and each other.
///
/// Fails when the free names of the role cannot hold `count`, or when the
/// draw budget runs out on a nearly full name space.
pub fn generate_node_names(
    role: NodeRole,
    count: u32,
    existing: &HashSet<String>,
) -> Result<Vec<String>> {
    let count = count as usize;
    let prefix = format!("{}-", role.prefix());
    let used = existing.iter().filter(|n| n.starts_with(&prefix)).count();
    let free = name_space().saturating_sub(used);
    if count > free {
        return Err(OrchestratorError::invalid_request(format!(
            "cannot name {} {} nodes: only {} names left",
            count,
            role.as_str(),
            free
        )));
    }

    let mut taken: HashSet<String> = existing.clone();
    let mut names = Vec::with_capacity(count);
    let mut attempts = count.saturating_mul(ATTEMPTS_PER_NAME);

    while names.len() < count {
        if attempts == 0 {
            return Err(OrchestratorError::operation(format!(
                "gave up naming {} nodes after {} attempts",
                role.as_str(),
                count.saturating_mul(ATTEMPTS_PER_NAME)
            )));
        }
        attempts -= 1;

        let candidate = format!("{}{}", prefix, random_suffix());
        if taken.insert(candidate.clone()) {
            names.push(candidate);
        }
    }
    Ok(names)
}
