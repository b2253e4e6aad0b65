//! In-process doubles for the SSH seams.
//!
//! [`Fabric`] plays every SSH server at once. Control connections dialed
//! through [`MockTransport`] open "channels" by connecting straight to real
//! loopback sockets, so bytes still flow end to end. A destination on
//! `127.0.0.1` is really connected to, which is how a child hop's session
//! rides through its parent's forward listener. Every interesting call is
//! appended to a shared event log together with everything the fabric logs.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    fmt,
    io,
    net::TcpListener as StdTcpListener,
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use hc_types::HopSpec;
use ssh_core::{
    SshCoreError,
    SshResult,
    forwarding::{Accepted, DeviceListener, Endpoint, ForwardStream},
    logging::{Logger, SharedLogger},
    topology::{HopState, Topology},
    transport::{ControlConnection, Credential, Transport},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

pub const STEP: Duration = Duration::from_secs(5);

pub fn pick_free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("ephemeral port addr")
        .port()
}

pub fn port_is_free(port: u16) -> bool {
    StdTcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Echo server on an ephemeral loopback port.
pub async fn spawn_echo() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    Ok(port)
}

/// Write `payload` and expect it echoed back.
pub async fn echo_round_trip(port: u16, payload: &[u8]) -> io::Result<()> {
    let mut stream = time::timeout(STEP, TcpStream::connect(("127.0.0.1", port))).await??;
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    time::timeout(STEP, stream.read_exact(&mut buf)).await??;
    if buf != payload {
        return Err(io::Error::other(format!("echoed {buf:?}, wanted {payload:?}")));
    }
    Ok(())
}

/// Resolves once the hop labelled `label` reaches `wanted`.
pub async fn wait_for_state(topology: &Topology, label: &str, wanted: HopState) -> anyhow::Result<()> {
    let index = topology.find(label).ok_or_else(|| anyhow::anyhow!("no hop {label}"))?;
    let mut state = topology.nodes()[index].subscribe();
    time::timeout(STEP, state.wait_for(|state| *state == wanted))
        .await
        .map_err(|_| anyhow::anyhow!("{label} never reached {wanted}; now {}", topology.nodes()[index].state()))??;
    Ok(())
}

#[derive(Default)]
struct State {
    events: Mutex<Vec<String>>,
    hosts: Mutex<HashMap<String, u16>>,
    failing_dials: Mutex<HashSet<String>>,
    hanging_dials: Mutex<HashSet<String>>,
    hanging_channels: Mutex<HashSet<String>>,
    refused_remote_ports: Mutex<HashSet<u16>>,
    failing_channels: AtomicUsize,
    sessions: Mutex<HashMap<String, CancellationToken>>,
    open_controls: Arc<AtomicUsize>,
    closes: AtomicUsize,
    open_channels: Arc<AtomicUsize>,
    remote_listeners: Arc<AtomicUsize>,
}

/// Shared switchboard behind every double.
#[derive(Clone, Default)]
pub struct Fabric {
    state: Arc<State>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: impl Into<String>) {
        self.state.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().unwrap().clone()
    }

    /// Index of the first event containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.events().iter().position(|event| event.contains(needle))
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Make `host` resolve to a loopback port for channels and dials.
    pub fn map_host(&self, host: &str, port: u16) {
        self.state.hosts.lock().unwrap().insert(host.to_string(), port);
    }

    pub fn fail_dial(&self, destination: &str) {
        self.state.failing_dials.lock().unwrap().insert(destination.to_string());
    }

    pub fn hang_dial(&self, destination: &str) {
        self.state.hanging_dials.lock().unwrap().insert(destination.to_string());
    }

    /// Channel opens towards `host` never resolve.
    pub fn hang_channels(&self, host: &str) {
        self.state.hanging_channels.lock().unwrap().insert(host.to_string());
    }

    pub fn refuse_remote_listen(&self, port: u16) {
        self.state.refused_remote_ports.lock().unwrap().insert(port);
    }

    /// The next `count` channel opens fail.
    pub fn fail_next_channels(&self, count: usize) {
        self.state.failing_channels.store(count, Ordering::SeqCst);
    }

    /// Drop the session to `destination` from the server side.
    pub fn kill(&self, destination: &str) {
        if let Some(token) = self.state.sessions.lock().unwrap().get(destination) {
            token.cancel();
        }
    }

    pub fn open_controls(&self) -> usize {
        self.state.open_controls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    pub fn remote_listeners(&self) -> usize {
        self.state.remote_listeners.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport { fabric: self.clone() }
    }

    /// A control connection that is not backed by any link.
    pub fn control(&self, name: &str) -> MockControl {
        MockControl::new(name, self.clone(), None)
    }

    pub fn logger(&self) -> SharedLogger {
        Arc::new(EventLogger { fabric: self.clone() })
    }

    fn resolve(&self, target: &Endpoint) -> Option<(String, u16)> {
        if let Some(port) = self.state.hosts.lock().unwrap().get(&target.host) {
            return Some(("127.0.0.1".to_string(), *port));
        }
        matches!(target.host.as_str(), "127.0.0.1" | "localhost").then(|| (target.host.clone(), target.port))
    }
}

struct EventLogger {
    fabric: Fabric,
}

impl Logger for EventLogger {
    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        self.fabric.record(format!("{level} {message}"));
    }
}

pub struct MockTransport {
    fabric: Fabric,
}

#[async_trait]
impl Transport for MockTransport {
    type Control = MockControl;

    async fn dial(&self, hop: &HopSpec, credentials: &[Credential]) -> SshResult<MockControl> {
        let fabric = &self.fabric;
        fabric.record(format!("dial {} as {} with {} credentials", hop.destination, hop.user, credentials.len()));

        let hanging = fabric.state.hanging_dials.lock().unwrap().contains(&hop.destination);
        if hanging {
            std::future::pending::<()>().await;
        }
        let failing = fabric.state.failing_dials.lock().unwrap().contains(&hop.destination);
        if failing {
            return Err(SshCoreError::AuthRejected {
                destination: hop.destination.clone(),
                message: "permission denied".into(),
            });
        }

        let endpoint = Endpoint::parse_with_default_port(&hop.destination, 22)?;
        let link = match fabric.resolve(&endpoint) {
            Some(addr) => {
                let stream = TcpStream::connect((addr.0.as_str(), addr.1))
                    .await
                    .map_err(|source| SshCoreError::ConnectionFailed {
                        address: endpoint.to_string(),
                        source,
                    })?;
                Some(stream)
            }
            None => None,
        };
        Ok(MockControl::new(&hop.destination, fabric.clone(), link))
    }
}

pub struct MockControl {
    name: String,
    fabric: Fabric,
    closed: CancellationToken,
    close_called: AtomicBool,
}

impl MockControl {
    fn new(name: &str, fabric: Fabric, link: Option<TcpStream>) -> Self {
        let closed = CancellationToken::new();
        fabric.state.open_controls.fetch_add(1, Ordering::SeqCst);
        fabric.state.sessions.lock().unwrap().insert(name.to_string(), closed.clone());
        if let Some(mut link) = link {
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        read = link.read(&mut buf) => match read {
                            Ok(0) | Err(_) => {
                                closed.cancel();
                                break;
                            }
                            Ok(_) => {}
                        },
                    }
                }
            });
        }
        Self {
            name: name.to_string(),
            fabric,
            closed,
            close_called: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ControlConnection for MockControl {
    async fn open_channel(&self, target: &Endpoint, origin: &Endpoint) -> SshResult<ForwardStream> {
        let fabric = &self.fabric;
        fabric.record(format!("channel {} -> {target} from {}", self.name, origin.host));
        let hanging = fabric.state.hanging_channels.lock().unwrap().contains(&target.host);
        if hanging {
            std::future::pending::<()>().await;
        }
        let failing = fabric
            .state
            .failing_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SshCoreError::ChannelFailed {
                address: target.to_string(),
                message: "administratively prohibited".into(),
            });
        }
        let (host, port) = fabric.resolve(target).ok_or_else(|| SshCoreError::ChannelFailed {
            address: target.to_string(),
            message: "no route to host".into(),
        })?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|source| SshCoreError::ConnectionFailed {
                address: target.to_string(),
                source,
            })?;
        Ok(Box::new(Counted {
            inner: stream,
            _guard: CountGuard::new(&fabric.state.open_channels),
        }))
    }

    async fn request_remote_listen(&self, bind: &Endpoint) -> SshResult<Box<dyn DeviceListener>> {
        let fabric = &self.fabric;
        fabric.record(format!("remote-listen {} {bind}", self.name));
        let refused = fabric.state.refused_remote_ports.lock().unwrap().contains(&bind.port);
        if refused {
            return Err(SshCoreError::RemoteBindFailed {
                address: bind.to_string(),
                message: "tcpip-forward refused".into(),
            });
        }
        let listener = TcpListener::bind(("127.0.0.1", bind.port))
            .await
            .map_err(|source| SshCoreError::BindFailed {
                address: bind.to_string(),
                source,
            })?;
        Ok(Box::new(MockRemoteListener {
            endpoint: bind.clone(),
            listener: Some(listener),
            guard: Some(CountGuard::new(&fabric.state.remote_listeners)),
        }))
    }

    async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        if self.close_called.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fabric.record(format!("close {}", self.name));
        self.fabric.state.closes.fetch_add(1, Ordering::SeqCst);
        self.fabric.state.open_controls.fetch_sub(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

struct MockRemoteListener {
    endpoint: Endpoint,
    listener: Option<TcpListener>,
    guard: Option<CountGuard>,
}

#[async_trait]
impl DeviceListener for MockRemoteListener {
    async fn accept(&mut self) -> SshResult<Accepted> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| SshCoreError::Other("remote listener closed".into()))?;
        let (stream, origin) = listener.accept().await?;
        Ok(Accepted {
            stream: Box::new(stream),
            origin: Endpoint::new(origin.ip().to_string(), origin.port()),
        })
    }

    fn local_endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn close(&mut self) {
        self.listener.take();
        self.guard.take();
    }
}

struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A channel stream that counts itself while alive.
struct Counted {
    inner: TcpStream,
    _guard: CountGuard,
}

impl AsyncRead for Counted {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Counted {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
