use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use hc_types::{HopSpec, TunnelFile};

#[derive(Debug, Parser)]
#[command(name = "hopchain", about = "Open chained SSH tunnels described by a YAML hop tree")]
pub struct TunnelArgs {
    /// Tunnel file describing secrets and hops
    #[arg(value_name = "CONFIG", env = "HOPCHAIN_CONFIG")]
    pub config: PathBuf,
    /// Validate the file and print the hop tree without connecting
    #[arg(long, action = ArgAction::SetTrue)]
    pub check: bool,
    /// Log filter (e.g. `debug`, `hopchain=debug,russh=warn`); overrides RUST_LOG
    #[arg(long = "log-level", value_name = "FILTER")]
    pub log_level: Option<String>,
}

impl TunnelArgs {
    /// Load and validate the configured file.
    pub fn load(&self) -> Result<(TunnelFile, Vec<HopSpec>)> {
        let file = TunnelFile::load(&self.config).with_context(|| format!("loading {}", self.config.display()))?;
        let hops = file.hops().with_context(|| format!("validating {}", self.config.display()))?;
        Ok((file, hops))
    }
}

/// One line per hop and rule, indented by depth.
pub fn describe(hops: &[HopSpec]) -> Vec<String> {
    let mut lines = Vec::new();
    for hop in hops {
        describe_hop(hop, 0, &mut lines);
    }
    lines
}

fn describe_hop(hop: &HopSpec, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    lines.push(format!("{indent}{} (timeout {}s)", hop.label(), hop.dial_timeout().as_secs()));
    for rule in &hop.forward {
        let state = if rule.ignore { " [ignored]" } else { "" };
        lines.push(format!("{indent}  forward {}: {}:{} -> {}{state}", rule.name, rule.bind_host(), rule.port, rule.target));
    }
    for rule in &hop.reverse {
        let state = if rule.ignore { " [ignored]" } else { "" };
        lines.push(format!("{indent}  reverse {}: {}:{} -> {}{state}", rule.name, rule.bind_host(), rule.port, rule.target));
    }
    for child in &hop.through {
        describe_hop(child, depth + 1, lines);
    }
}
