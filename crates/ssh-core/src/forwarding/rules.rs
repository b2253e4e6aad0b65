use std::fmt;

use hc_types::{HopSpec, RuleKind, RuleSpec};

use crate::SshCoreError;

type Result<T> = crate::SshResult<T>;

/// Which device listens and which device dials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Listen on the local machine, dial through the control connection.
    Forward,
    /// Listen on the peer, dial from the local machine.
    Reverse,
}

impl From<RuleKind> for Direction {
    fn from(kind: RuleKind) -> Self {
        match kind {
            RuleKind::Forward => Direction::Forward,
            RuleKind::Reverse => Direction::Reverse,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// A `host:port` pair; IPv6 hosts are stored without brackets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parse `host:port` or `[v6]:port`.
    pub fn parse(input: &str) -> Result<Self> {
        let parts = split_colon_parts(input);
        match parts.as_slice() {
            [host, port] => {
                let host = normalize_host(host).ok_or_else(|| SshCoreError::empty("destination host"))?;
                Ok(Self::new(host, parse_port(port)?))
            }
            [] => Err(SshCoreError::empty("destination")),
            _ => Err(SshCoreError::Other(format!("expected host:port, got {input:?}"))),
        }
    }

    /// Parse a destination that may omit its port.
    pub fn parse_with_default_port(input: &str, default_port: u16) -> Result<Self> {
        let parts = split_colon_parts(input);
        match parts.as_slice() {
            [host] => {
                let host = normalize_host(host).ok_or_else(|| SshCoreError::empty("destination host"))?;
                Ok(Self::new(host, default_port))
            }
            _ => Self::parse(input),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A validated rule, ready for the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelRule {
    pub name: String,
    pub direction: Direction,
    pub bind: Endpoint,
    pub target: Endpoint,
}

impl TunnelRule {
    pub fn forward(name: impl Into<String>, bind: Endpoint, target: Endpoint) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Forward,
            bind,
            target,
        }
    }

    pub fn reverse(name: impl Into<String>, bind: Endpoint, target: Endpoint) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Reverse,
            bind,
            target,
        }
    }

    /// Build from a configured rule, rejecting bad ports and destinations.
    pub fn from_spec(kind: RuleKind, spec: &RuleSpec) -> Result<Self> {
        let port = u16::try_from(spec.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| SshCoreError::invalid_rule(&spec.name, SshCoreError::InvalidPort(spec.port.to_string()).to_string()))?;
        if spec.target.trim().is_empty() {
            return Err(SshCoreError::invalid_rule(&spec.name, "destination must not be empty"));
        }
        let target = Endpoint::parse(&spec.target).map_err(|err| SshCoreError::invalid_rule(&spec.name, err.to_string()))?;
        let rule = Self {
            name: spec.name.clone(),
            direction: kind.into(),
            bind: Endpoint::new(spec.bind_host(), port),
            target,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Checks the engine repeats before binding anything.
    pub fn validate(&self) -> Result<()> {
        if self.bind.port == 0 {
            return Err(SshCoreError::invalid_rule(&self.name, SshCoreError::InvalidPort("0".into()).to_string()));
        }
        if self.bind.host.trim().is_empty() {
            return Err(SshCoreError::invalid_rule(&self.name, "bind address must not be empty"));
        }
        if self.target.host.trim().is_empty() {
            return Err(SshCoreError::invalid_rule(&self.name, "destination must not be empty"));
        }
        if self.target.port == 0 {
            return Err(SshCoreError::invalid_rule(&self.name, SshCoreError::InvalidPort("0".into()).to_string()));
        }
        Ok(())
    }

    /// One-line summary, `forward db 127.0.0.1:5432 -> db.internal:5432`.
    pub fn describe(&self) -> String {
        format!("{} {} {} -> {}", self.direction, self.name, self.bind, self.target)
    }
}

/// Turn a hop's enabled rules into engine rules; ignored rules are dropped first.
pub fn plan_rules(hop: &HopSpec) -> Result<Vec<TunnelRule>> {
    hop.active_rules().map(|(kind, spec)| TunnelRule::from_spec(kind, spec)).collect()
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| SshCoreError::InvalidPort(value.to_string()))
}

fn normalize_host(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let no_brackets = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(|inner| inner.to_string());
    no_brackets.or_else(|| Some(trimmed.to_string()))
}

fn split_colon_parts(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0;
    for ch in input.chars() {
        match ch {
            ':' if bracket_depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth > 0 {
                    bracket_depth -= 1;
                }
                current.push(ch);
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
