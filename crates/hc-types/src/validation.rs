//! Structural checks applied when a tunnel file is loaded.
//!
//! Per-rule checks (port range, destination syntax) belong to the tunnel
//! engine, which runs them again before binding anything; the checks here
//! cover relations between hops that no single engine can see.

use std::collections::{HashMap, HashSet};

use crate::{
    config::{ConfigError, SecretEntry}, hop::{HopSpec, RuleKind}
};

/// Every secret needs a unique, non-empty name.
pub fn validate_secrets(secrets: &[SecretEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for secret in secrets {
        if secret.name.trim().is_empty() {
            return Err(ConfigError::UnnamedSecret);
        }
        if !seen.insert(secret.name.as_str()) {
            return Err(ConfigError::DuplicateSecret(secret.name.clone()));
        }
    }
    Ok(())
}

/// Every secret an auth method names must be declared.
pub fn validate_secret_references(hops: &[HopSpec], secrets: &[SecretEntry]) -> Result<(), ConfigError> {
    let declared: HashSet<&str> = secrets.iter().map(|secret| secret.name.as_str()).collect();
    for hop in hops.iter().flat_map(HopSpec::walk) {
        for method in &hop.auth {
            if let Some(missing) = method.secret_names().find(|name| !declared.contains(name)) {
                return Err(ConfigError::UnknownSecret {
                    secret: missing.to_string(),
                    hop: hop.label(),
                });
            }
        }
    }
    Ok(())
}

/// Reject forests that cannot start: two forward rules on one local port, or a
/// hop whose loopback destination is served by its own subtree.
pub fn validate_topology(hops: &[HopSpec]) -> Result<(), ConfigError> {
    let mut bound: HashMap<u32, String> = HashMap::new();
    for hop in hops.iter().flat_map(HopSpec::walk) {
        for (_, rule) in hop.active_rules().filter(|(kind, _)| *kind == RuleKind::Forward) {
            let owner = format!("{} rule {}", hop.label(), rule.name);
            if let Some(first) = bound.insert(rule.port, owner.clone()) {
                return Err(ConfigError::DuplicatePort {
                    port: rule.port,
                    first,
                    second: owner,
                });
            }
        }
    }

    for hop in hops.iter().flat_map(HopSpec::walk) {
        let Some(port) = loopback_port(&hop.destination) else {
            continue;
        };
        let served_by_subtree = hop
            .walk()
            .into_iter()
            .flat_map(|node| node.active_rules())
            .any(|(kind, rule)| kind == RuleKind::Forward && rule.port == port);
        if served_by_subtree {
            return Err(ConfigError::Cycle { hop: hop.label(), port });
        }
    }
    Ok(())
}

/// Port of a `host:port` destination when the host is a loopback name.
pub fn loopback_port(destination: &str) -> Option<u32> {
    let (host, port) = destination.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let loopback = host.eq_ignore_ascii_case("localhost") || host == "::1" || host.starts_with("127.");
    if !loopback {
        return None;
    }
    port.parse().ok()
}

#[cfg(test)]
#[path = "validation_tests.rs"]
mod tests;
