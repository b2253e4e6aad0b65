//! Shared type definitions for hopchain.
//!
//! This crate holds the dependency-light description of a hop tree: the
//! in-memory [`hop::HopSpec`] model consumed by the tunnel fabric, the YAML
//! schema it is loaded from, and the structural checks applied at load time.

pub mod config;
pub mod hop;
pub mod validation;

pub use config::{ConfigError, TunnelFile};
pub use hop::{AuthMethodSpec, DEFAULT_BIND_ADDRESS, DEFAULT_DIAL_TIMEOUT, ForwardRule, HopSpec, ReverseRule, RuleKind, RuleSpec};
