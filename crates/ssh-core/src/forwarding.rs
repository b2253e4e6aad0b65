//! Port forwarding for one hop.
//!
//! This module provides:
//! - The [`NetworkDevice`] abstraction over "this machine" ([`LocalNetwork`])
//!   and "the peer of a control connection" ([`RemoteNetwork`])
//! - Rule planning and validation ([`plan_rules`])
//! - Tunnel instances that copy bytes between an accepted and a dialed connection
//! - A bounded reachability probe
//!
//! The main entry point is [`TunnelEngine`], which binds one listener per rule
//! and spawns an instance per accepted connection.

mod device;
mod engine;
mod instance;
mod local;
mod probe;
mod readiness;
mod remote;
mod rules;

// Re-export public API
pub use device::{Accepted, DeviceListener, ForwardStream, ForwardStreamIo, NetworkDevice};
pub use engine::{Binding, EngineOptions, RunningHop, TunnelEngine};
pub use instance::{InstanceEnd, InstanceReport, TunnelInstance};
pub use local::LocalNetwork;
pub use probe::is_reachable;
pub use readiness::{NotReady, ReadySignal, ReadyWatch, ready_pair};
pub use remote::RemoteNetwork;
pub use rules::{Direction, Endpoint, TunnelRule, plan_rules};
