use std::{fmt, sync::Arc, time::Duration};

use hc_types::DEFAULT_DIAL_TIMEOUT;
use tokio::{
    task::{JoinHandle, JoinSet}, time
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    device::{Accepted, DeviceListener, NetworkDevice}, instance::TunnelInstance, local::LocalNetwork, probe::is_reachable, readiness::{ReadyWatch, ready_pair}, remote::RemoteNetwork, rules::{Direction, Endpoint, TunnelRule}
};
use crate::{
    SshCoreError, fabric_debug, fabric_info, fabric_warn, logging::{SharedLogger, noop}, transport::ControlConnection
};

type Result<T> = crate::SshResult<T>;

/// Knobs for one engine.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Upper bound for each destination dial.
    pub dial_timeout: Duration,
    /// Probe forward destinations before binding. Advisory only.
    pub probe: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            probe: false,
        }
    }
}

/// A listener that is live for one rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub rule: String,
    pub direction: Direction,
    /// Address actually bound; the port may come from the peer for reverse rules.
    pub bound: Endpoint,
    pub target: Endpoint,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {} -> {}", self.direction, self.rule, self.bound, self.target)
    }
}

/// Drives the rules of one hop over one control connection.
pub struct TunnelEngine<C> {
    control: Arc<C>,
    label: String,
    options: EngineOptions,
    logger: SharedLogger,
}

impl<C> TunnelEngine<C>
where
    C: ControlConnection,
{
    /// Take ownership of `control`; the engine closes it exactly once.
    pub fn new(control: C) -> Self {
        Self {
            control: Arc::new(control),
            label: "hop".to_string(),
            options: EngineOptions::default(),
            logger: noop(),
        }
    }

    /// Name used in log lines.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Validate every rule, bind every listener, then start accepting.
    ///
    /// Startup is all-or-nothing: when a rule is invalid, a bind fails or
    /// `cancel` fires first, every listener opened so far and the control
    /// connection are closed before the error is returned. On success the
    /// returned hop is already ready.
    pub async fn start(self, rules: Vec<TunnelRule>, cancel: CancellationToken) -> Result<RunningHop<C>> {
        let Self {
            control,
            label,
            options,
            logger,
        } = self;

        if let Some(err) = rules.iter().find_map(|rule| rule.validate().err()) {
            control.close().await;
            return Err(err);
        }

        let local: Arc<dyn NetworkDevice> = Arc::new(LocalNetwork);
        let remote: Arc<dyn NetworkDevice> = Arc::new(RemoteNetwork::new(Arc::clone(&control)));

        if options.probe && !probe_forward_targets(&rules, &remote, &options, &cancel, &label, &logger).await {
            control.close().await;
            return Err(SshCoreError::Cancelled(label));
        }

        let mut opened: Vec<(TunnelRule, Box<dyn DeviceListener>)> = Vec::with_capacity(rules.len());
        for rule in rules {
            let device = match rule.direction {
                Direction::Forward => &local,
                Direction::Reverse => &remote,
            };
            let listened = tokio::select! {
                _ = cancel.cancelled() => Err(SshCoreError::Cancelled(label.clone())),
                listened = device.listen(&rule.bind) => listened,
            };
            match listened {
                Ok(listener) => opened.push((rule, listener)),
                Err(err) => {
                    if !matches!(err, SshCoreError::Cancelled(_)) {
                        fabric_warn!(logger, "{label}: unable to open tunnel {}: {err}", rule.name);
                    }
                    roll_back(opened, control.as_ref()).await;
                    return Err(err);
                }
            }
        }
        if cancel.is_cancelled() {
            roll_back(opened, control.as_ref()).await;
            return Err(SshCoreError::Cancelled(label));
        }

        let cancel = cancel.child_token();
        let tracker = TaskTracker::new();
        let (signal, ready) = ready_pair();
        let mut bindings = Vec::with_capacity(opened.len());
        let mut accept_loops = Vec::with_capacity(opened.len());
        for (rule, listener) in opened {
            bindings.push(Binding {
                rule: rule.name.clone(),
                direction: rule.direction,
                bound: listener.local_endpoint(),
                target: rule.target.clone(),
            });
            let dialer = match rule.direction {
                Direction::Forward => Arc::clone(&remote),
                Direction::Reverse => Arc::clone(&local),
            };
            let ctx = AcceptContext {
                rule: Arc::new(rule),
                dialer,
                dial_timeout: options.dial_timeout,
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                logger: Arc::clone(&logger),
            };
            accept_loops.push(tokio::spawn(accept_loop(listener, ctx)));
        }
        signal.fire();

        Ok(RunningHop {
            control,
            label,
            cancel,
            tracker,
            accept_loops,
            bindings,
            ready,
            logger,
        })
    }
}

/// A started hop: its listeners, accept loops and live instances.
pub struct RunningHop<C> {
    control: Arc<C>,
    label: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_loops: Vec<JoinHandle<Option<Box<dyn DeviceListener>>>>,
    bindings: Vec<Binding>,
    ready: ReadyWatch,
    logger: SharedLogger,
}

impl<C> RunningHop<C>
where
    C: ControlConnection,
{
    pub fn ready(&self) -> ReadyWatch {
        self.ready.clone()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Instances currently copying (including ones still dialing).
    pub fn live_instances(&self) -> usize {
        self.tracker.len()
    }

    /// Resolves when the control connection is gone.
    pub async fn closed(&self) {
        self.control.wait_closed().await
    }

    /// Stop accepting, wait for live instances, close listeners, close the control connection.
    pub async fn shutdown(self) {
        let Self {
            control,
            label,
            cancel,
            tracker,
            accept_loops,
            logger,
            ..
        } = self;

        cancel.cancel();
        let mut listeners = Vec::with_capacity(accept_loops.len());
        for handle in accept_loops {
            match handle.await {
                Ok(Some(listener)) => listeners.push(listener),
                Ok(None) => {}
                Err(err) => fabric_warn!(logger, "{label}: accept loop ended abnormally: {err}"),
            }
        }

        tracker.close();
        tracker.wait().await;
        fabric_info!(logger, "all tunnels for {label} are closed");

        for mut listener in listeners {
            listener.close().await;
        }
        control.close().await;
        fabric_debug!(logger, "{label}: control connection closed");
    }
}

/// Probe every forward destination at once. False when `cancel` fired first.
async fn probe_forward_targets(
    rules: &[TunnelRule],
    remote: &Arc<dyn NetworkDevice>,
    options: &EngineOptions,
    cancel: &CancellationToken,
    label: &str,
    logger: &SharedLogger,
) -> bool {
    let mut probes = JoinSet::new();
    for rule in rules.iter().filter(|rule| rule.direction == Direction::Forward) {
        let device = Arc::clone(remote);
        let (name, target, timeout) = (rule.name.clone(), rule.target.clone(), options.dial_timeout);
        probes.spawn(async move {
            let reachable = is_reachable(device.as_ref(), &target, timeout).await;
            (name, target, reachable)
        });
    }
    let report = async {
        while let Some(joined) = probes.join_next().await {
            if let Ok((name, target, false)) = joined {
                fabric_warn!(logger, "{label}: destination {target} of tunnel {name} is not reachable yet");
            }
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = report => true,
    }
}

async fn roll_back<C: ControlConnection>(opened: Vec<(TunnelRule, Box<dyn DeviceListener>)>, control: &C) {
    for (_, mut listener) in opened {
        listener.close().await;
    }
    control.close().await;
}

struct AcceptContext {
    rule: Arc<TunnelRule>,
    dialer: Arc<dyn NetworkDevice>,
    dial_timeout: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    logger: SharedLogger,
}

/// Hands the listener back on cancellation so teardown can close it in order.
async fn accept_loop(mut listener: Box<dyn DeviceListener>, ctx: AcceptContext) -> Option<Box<dyn DeviceListener>> {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            accepted = listener.accept() => Some(accepted),
        };
        let Some(accepted) = accepted else {
            return Some(listener);
        };
        match accepted {
            Ok(accepted) => {
                ctx.tracker.spawn(serve_connection(
                    accepted,
                    Arc::clone(&ctx.rule),
                    Arc::clone(&ctx.dialer),
                    ctx.dial_timeout,
                    ctx.cancel.clone(),
                    Arc::clone(&ctx.logger),
                ));
            }
            Err(err) => {
                fabric_warn!(ctx.logger, "tunnel {}: accept failed, no longer forwarding: {err}", ctx.rule.name);
                listener.close().await;
                return None;
            }
        }
    }
}

async fn serve_connection(
    accepted: Accepted,
    rule: Arc<TunnelRule>,
    dialer: Arc<dyn NetworkDevice>,
    dial_timeout: Duration,
    cancel: CancellationToken,
    logger: SharedLogger,
) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = time::timeout(dial_timeout, dialer.dial(&rule.target, &accepted.origin)) => dialed,
    };
    let dialed = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            fabric_warn!(logger, "tunnel {}: {err}", rule.name);
            return;
        }
        Err(_) => {
            let err = SshCoreError::DialTimeout {
                address: rule.target.to_string(),
                timeout: dial_timeout,
            };
            fabric_warn!(logger, "tunnel {}: {err}", rule.name);
            return;
        }
    };
    fabric_debug!(logger, "tunnel {}: {} connected to {}", rule.name, accepted.origin, rule.target);
    TunnelInstance::new(rule.name.clone(), accepted.stream, dialed).run(cancel, logger).await;
}
