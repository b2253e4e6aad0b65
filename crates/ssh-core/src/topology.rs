//! Hop tree orchestration.
//!
//! The hop forest is flattened into an arena of [`HopNode`]s. Every node runs
//! as its own task and walks
//!
//! ```text
//! pending -> connecting -> ready -> children-running -> tearing-down -> closed
//!                 \-> errored
//! ```
//!
//! A node's state lives in a `watch` channel; children block on their parent's
//! channel until it reports ready, so a child's control connection is never
//! dialed early. Each node owns a child token of its parent's cancellation
//! token, so cancelling the run (or losing a parent) reaches the whole subtree
//! at once. Teardown waits for children before the parent engine stops, which
//! keeps every parent's control connection alive for as long as a child uses it.

use std::{fmt, sync::Arc};

use hc_types::HopSpec;
use thiserror::Error;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    SshCoreError, fabric_error, fabric_info, fabric_warn, forwarding::{Direction, EngineOptions, TunnelEngine, plan_rules}, logging::{SharedLogger, noop}, transport::{SecretResolver, Transport, resolve_credentials}
};

/// Lifecycle of one hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HopState {
    Pending,
    Connecting,
    Ready,
    ChildrenRunning,
    TearingDown,
    Closed,
    Errored,
}

impl HopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HopState::Closed | HopState::Errored)
    }

    fn admits_children(self) -> bool {
        matches!(self, HopState::Ready | HopState::ChildrenRunning)
    }
}

impl fmt::Display for HopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HopState::Pending => "pending",
            HopState::Connecting => "connecting",
            HopState::Ready => "ready",
            HopState::ChildrenRunning => "children-running",
            HopState::TearingDown => "tearing-down",
            HopState::Closed => "closed",
            HopState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// A failure attributed to one hop.
#[derive(Debug, Error)]
#[error("{hop}: {source}")]
pub struct HopError {
    pub hop: String,
    #[source]
    pub source: SshCoreError,
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no successful connections{}", summarize(.failures))]
    NoneReady { failures: Vec<HopError> },
}

fn summarize(failures: &[HopError]) -> String {
    failures.iter().map(|failure| format!("; {failure}")).collect()
}

/// Outcome of a run in which at least one root became ready.
#[derive(Debug)]
pub struct TopologyReport {
    /// Final state of every hop, in arena order.
    pub hops: Vec<(String, HopState)>,
    /// Hops that errored while connecting.
    pub failures: Vec<HopError>,
}

/// One arena slot.
pub struct HopNode {
    spec: HopSpec,
    label: String,
    parent: Option<usize>,
    children: Vec<usize>,
    state: watch::Sender<HopState>,
    reached_ready: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl HopNode {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn state(&self) -> HopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HopState> {
        self.state.subscribe()
    }

    fn set(&self, state: HopState) {
        self.state.send_replace(state);
    }
}

/// The flattened hop forest.
pub struct Topology {
    nodes: Vec<HopNode>,
    roots: Vec<usize>,
}

impl Topology {
    /// Flatten `roots` depth-first; every node's token is a child of its parent's.
    pub fn build(roots: Vec<HopSpec>, cancel: &CancellationToken) -> Self {
        let mut topology = Self {
            nodes: Vec::new(),
            roots: Vec::with_capacity(roots.len()),
        };
        for root in roots {
            let index = topology.insert(root, None, cancel);
            topology.roots.push(index);
        }
        topology
    }

    fn insert(&mut self, mut spec: HopSpec, parent: Option<usize>, parent_cancel: &CancellationToken) -> usize {
        let through = std::mem::take(&mut spec.through);
        let cancel = parent_cancel.child_token();
        let index = self.nodes.len();
        self.nodes.push(HopNode {
            label: spec.label(),
            spec,
            parent,
            children: Vec::with_capacity(through.len()),
            state: watch::Sender::new(HopState::Pending),
            reached_ready: watch::Sender::new(false),
            cancel: cancel.clone(),
        });
        for child in through {
            let child_index = self.insert(child, Some(index), &cancel);
            self.nodes[index].children.push(child_index);
        }
        index
    }

    pub fn nodes(&self) -> &[HopNode] {
        &self.nodes
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Label and current state of every hop.
    pub fn snapshot(&self) -> Vec<(String, HopState)> {
        self.nodes.iter().map(|node| (node.label.clone(), node.state())).collect()
    }

    /// Index of the first hop with this label.
    pub fn find(&self, label: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.label == label)
    }
}

/// Drives one tunnel engine per hop.
pub struct Orchestrator<T> {
    transport: Arc<T>,
    secrets: Arc<dyn SecretResolver>,
    logger: SharedLogger,
}

impl<T> Orchestrator<T>
where
    T: Transport,
{
    pub fn new(transport: T, secrets: impl SecretResolver + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            secrets: Arc::new(secrets),
            logger: noop(),
        }
    }

    pub fn logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Build and drive the forest until every hop is closed or errored.
    pub async fn run(&self, roots: Vec<HopSpec>, cancel: CancellationToken) -> Result<TopologyReport, TopologyError> {
        let topology = Arc::new(Topology::build(roots, &cancel));
        self.drive(topology, cancel).await
    }

    /// Drive an already built topology; callers may keep a clone to watch states.
    ///
    /// Fails only when no root became ready; a cancelled run is not a failure.
    pub async fn drive(&self, topology: Arc<Topology>, cancel: CancellationToken) -> Result<TopologyReport, TopologyError> {
        let mut tasks = JoinSet::new();
        for index in 0..topology.len() {
            let run = NodeRun {
                topology: Arc::clone(&topology),
                index,
                transport: Arc::clone(&self.transport),
                secrets: Arc::clone(&self.secrets),
                logger: Arc::clone(&self.logger),
            };
            tasks.spawn(run.run());
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failures.push(failure),
                Err(err) => fabric_error!(self.logger, "hop task ended abnormally: {err}"),
            }
        }

        let any_root_ready = topology.roots().iter().any(|&root| *topology.nodes[root].reached_ready.borrow());
        if !any_root_ready && !cancel.is_cancelled() {
            return Err(TopologyError::NoneReady { failures });
        }
        Ok(TopologyReport {
            hops: topology.snapshot(),
            failures,
        })
    }
}

struct NodeRun<T> {
    topology: Arc<Topology>,
    index: usize,
    transport: Arc<T>,
    secrets: Arc<dyn SecretResolver>,
    logger: SharedLogger,
}

impl<T> NodeRun<T>
where
    T: Transport,
{
    fn node(&self) -> &HopNode {
        &self.topology.nodes[self.index]
    }

    async fn run(self) -> Result<(), HopError> {
        let node = self.node();

        if let Some(parent) = node.parent
            && !self.parent_became_ready(parent).await
        {
            node.set(HopState::Closed);
            return Ok(());
        }

        node.set(HopState::Connecting);
        validate_node(&node.spec).map_err(|err| self.fail(err))?;
        let rules = plan_rules(&node.spec).map_err(|err| self.fail(err))?;
        let credentials = resolve_credentials(&node.spec.auth, self.secrets.as_ref()).map_err(|err| self.fail(err))?;

        let dialed = tokio::select! {
            _ = node.cancel.cancelled() => None,
            dialed = self.transport.dial(&node.spec, &credentials) => Some(dialed),
        };
        let Some(dialed) = dialed else {
            node.set(HopState::Closed);
            return Ok(());
        };
        let control = dialed.map_err(|err| self.fail(err))?;

        let options = EngineOptions {
            dial_timeout: node.spec.dial_timeout(),
            probe: node.spec.probe,
        };
        // `start` returns only after readiness has fired.
        let started = TunnelEngine::new(control)
            .label(node.spec.destination.clone())
            .options(options)
            .logger(Arc::clone(&self.logger))
            .start(rules, node.cancel.clone())
            .await;
        let hop = match started {
            Ok(hop) => hop,
            Err(SshCoreError::Cancelled(_)) => {
                node.set(HopState::Closed);
                return Ok(());
            }
            Err(err) => return Err(self.fail(err)),
        };

        node.reached_ready.send_replace(true);
        node.set(HopState::Ready);
        fabric_info!(self.logger, "Connection to {} successfully established...", node.spec.destination);
        for binding in hop.bindings() {
            let verb = match binding.direction {
                Direction::Forward => "forwarded",
                Direction::Reverse => "reverse forwarded",
            };
            fabric_info!(self.logger, "\testablished tunnel {}: {verb} {} to {}", binding.rule, binding.bound.port, binding.target);
        }
        node.set(HopState::ChildrenRunning);

        let peer_closed = tokio::select! {
            _ = node.cancel.cancelled() => false,
            _ = hop.closed() => true,
        };
        if peer_closed {
            fabric_warn!(self.logger, "{} terminated our connection", node.spec.destination);
            node.cancel.cancel();
        } else {
            fabric_info!(self.logger, "{}: terminating due to cancellation", node.spec.destination);
        }

        node.set(HopState::TearingDown);
        self.wait_for_children().await;
        hop.shutdown().await;
        node.set(HopState::Closed);
        Ok(())
    }

    /// True once the parent is ready; false if it ends first or this hop is cancelled.
    async fn parent_became_ready(&self, parent: usize) -> bool {
        let node = self.node();
        let mut parent_state = self.topology.nodes[parent].subscribe();
        let observed = tokio::select! {
            _ = node.cancel.cancelled() => None,
            state = parent_state.wait_for(|state| state.admits_children() || state.is_terminal() || *state == HopState::TearingDown) => {
                state.ok().map(|state| *state)
            }
        };
        matches!(observed, Some(state) if state.admits_children())
    }

    async fn wait_for_children(&self) {
        for &child in &self.node().children {
            let mut state = self.topology.nodes[child].subscribe();
            let _ = state.wait_for(|state| state.is_terminal()).await;
        }
    }

    fn fail(&self, source: SshCoreError) -> HopError {
        let node = self.node();
        node.set(HopState::Errored);
        fabric_error!(self.logger, "{}: {source}", node.label);
        HopError {
            hop: node.label.clone(),
            source,
        }
    }
}

/// Checks the parser may have skipped for hops built in code.
fn validate_node(spec: &HopSpec) -> Result<(), SshCoreError> {
    if spec.destination.trim().is_empty() {
        return Err(SshCoreError::empty("destination"));
    }
    if spec.auth.is_empty() {
        return Err(SshCoreError::empty("auth methods"));
    }
    Ok(())
}

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;
