//! End-to-end tunnels through an in-process russh server.
//!
//! The server accepts password auth for `testuser`, proxies `direct-tcpip`
//! channels to real sockets and honours `tcpip-forward` by listening locally
//! and opening `forwarded-tcpip` channels back to the client.
//!
//! Feature gated behind `forwarding-tests` to avoid running in normal test suites.
#![cfg(feature = "forwarding-tests")]

use std::{
    collections::HashMap, net::TcpListener as StdTcpListener, sync::{Arc, Mutex}, time::Duration
};

use anyhow::Result;
use client_core::{ClientError, SecretsVault, run_hops};
use hc_types::{HopSpec, TunnelFile};
use russh::{
    Channel, keys::{Algorithm, PrivateKey, ssh_key::rand_core::OsRng}, MethodKind, MethodSet, server::{self, Auth, Server as _, Session}
};
use ssh_core::{
    SshCoreError, logging::noop, topology::{HopState, TopologyError, TopologyReport}
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional}, net::{TcpListener, TcpStream}, task::JoinHandle, time::{self, sleep}
};
use tokio_util::sync::CancellationToken;

const PASSWORD: &str = "the right password";
const STEP: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forward_rule_reaches_target_through_ssh() -> Result<()> {
    let sshd = TestServer::start().await?;
    let echo = spawn_echo().await?;
    let local = pick_free_port();
    let yaml = format!(
        r#"
secrets:
  - name: pw
sshconfigs:
  - destination: 127.0.0.1:{sshd}
    user: testuser
    timeout: 5
    auth:
      - pwdauth:
          passwordsecret: pw
    tunnels:
      - name: web
        port: {local}
        target: 127.0.0.1:{echo}
"#,
        sshd = sshd.port
    );

    let (cancel, run) = start(&yaml, PASSWORD)?;
    eventually_echo(local, b"through one hop").await?;
    assert!(sshd.direct.lock().unwrap().iter().any(|target| target == &format!("127.0.0.1:{echo}")));

    cancel.cancel();
    let report = time::timeout(STEP, run).await???;
    assert_all_closed(&report);
    assert!(port_is_free(local));
    sshd.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn child_hop_rides_its_parents_tunnel() -> Result<()> {
    let outer_sshd = TestServer::start().await?;
    let inner_sshd = TestServer::start().await?;
    let echo = spawn_echo().await?;
    let (jump, app) = (pick_free_port(), pick_free_port());
    let yaml = format!(
        r#"
secrets:
  - name: pw
sshconfigs:
  - destination: 127.0.0.1:{outer}
    user: testuser
    auth:
      - pwdauth:
          passwordsecret: pw
    tunnels:
      - name: jump
        port: {jump}
        target: 127.0.0.1:{inner}
    throughssh:
      - destination: 127.0.0.1:{jump}
        user: testuser
        auth:
          - pwdauth:
              passwordsecret: pw
        tunnels:
          - name: app
            port: {app}
            target: 127.0.0.1:{echo}
"#,
        outer = outer_sshd.port,
        inner = inner_sshd.port
    );

    let (cancel, run) = start(&yaml, PASSWORD)?;
    eventually_echo(app, b"through two hops").await?;
    assert!(inner_sshd.direct.lock().unwrap().iter().any(|target| target == &format!("127.0.0.1:{echo}")));
    assert!(outer_sshd.direct.lock().unwrap().iter().any(|target| target == &format!("127.0.0.1:{}", inner_sshd.port)));

    cancel.cancel();
    let report = time::timeout(STEP, run).await???;
    assert_all_closed(&report);
    assert!(port_is_free(jump) && port_is_free(app));
    outer_sshd.stop().await;
    inner_sshd.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reverse_rule_serves_connections_made_on_the_peer() -> Result<()> {
    let sshd = TestServer::start().await?;
    let echo = spawn_echo().await?;
    let remote = pick_free_port();
    let yaml = format!(
        r#"
secrets:
  - name: pw
sshconfigs:
  - destination: 127.0.0.1:{sshd}
    user: testuser
    auth:
      - pwdauth:
          passwordsecret: pw
    reversetunnels:
      - name: callback
        port: {remote}
        target: 127.0.0.1:{echo}
"#,
        sshd = sshd.port
    );

    let (cancel, run) = start(&yaml, PASSWORD)?;
    eventually_echo(remote, b"from the peer").await?;

    cancel.cancel();
    let report = time::timeout(STEP, run).await???;
    assert_all_closed(&report);
    sshd.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_password_fails_the_run() -> Result<()> {
    let sshd = TestServer::start().await?;
    let local = pick_free_port();
    let yaml = format!(
        r#"
secrets:
  - name: pw
sshconfigs:
  - destination: 127.0.0.1:{sshd}
    user: testuser
    auth:
      - pwdauth:
          passwordsecret: pw
    tunnels:
      - name: web
        port: {local}
        target: 127.0.0.1:9
"#,
        sshd = sshd.port
    );

    let (_cancel, run) = start(&yaml, "not it")?;
    let err = time::timeout(STEP, run).await??.err().expect("run must fail");
    let ClientError::Topology(TopologyError::NoneReady { failures }) = err else {
        panic!("expected NoneReady");
    };
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].source, SshCoreError::AuthRejected { .. }), "{}", failures[0]);
    assert!(port_is_free(local));
    sshd.stop().await;
    Ok(())
}

type RunHandle = JoinHandle<Result<TopologyReport, ClientError>>;

fn start(yaml: &str, password: &str) -> Result<(CancellationToken, RunHandle)> {
    let file = TunnelFile::from_yaml(yaml)?;
    let hops: Vec<HopSpec> = file.hops()?;
    let password = password.to_string();
    let vault = SecretsVault::resolve_with(&file.secrets, |_| None, |_| Ok(password.clone()))?;
    let cancel = CancellationToken::new();
    let run = tokio::spawn(run_hops(hops, vault, cancel.clone(), noop()));
    Ok((cancel, run))
}

fn assert_all_closed(report: &TopologyReport) {
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.hops.iter().all(|(_, state)| *state == HopState::Closed), "{:?}", report.hops);
}

/// Retry until the tunnel is up, then require a clean echo.
async fn eventually_echo(port: u16, payload: &[u8]) -> Result<()> {
    let deadline = time::Instant::now() + STEP;
    loop {
        match echo_once(port, payload).await {
            Ok(()) => return Ok(()),
            Err(err) if time::Instant::now() >= deadline => return Err(err),
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }
}

async fn echo_once(port: u16, payload: &[u8]) -> Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf)).await??;
    anyhow::ensure!(buf == payload, "echoed {buf:?}");
    Ok(())
}

async fn spawn_echo() -> Result<u16> {
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

fn pick_free_port() -> u16 {
    StdTcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

fn port_is_free(port: u16) -> bool {
    StdTcpListener::bind(("127.0.0.1", port)).is_ok()
}

struct TestServer {
    port: u16,
    direct: Arc<Mutex<Vec<String>>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let port = pick_free_port();
        let mut config = server::Config {
            auth_rejection_time: Duration::from_millis(50),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        };
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::Password);
        config.methods = methods;
        config.keys.push(PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?);

        let direct = Arc::new(Mutex::new(Vec::new()));
        let mut server = TunnelServer { direct: direct.clone() };
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let stop = CancellationToken::new();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move {
                let running = server.run_on_socket(Arc::new(config), &listener);
                let handle = running.handle();
                tokio::select! {
                    res = running => res.expect("server run"),
                    _ = stop.cancelled() => handle.shutdown("test complete".into()),
                }
            }
        });
        sleep(Duration::from_millis(25)).await;
        Ok(Self { port, direct, stop, task })
    }

    async fn stop(self) {
        self.stop.cancel();
        let _ = time::timeout(STEP, self.task).await;
    }
}

struct TunnelServer {
    direct: Arc<Mutex<Vec<String>>>,
}

impl server::Server for TunnelServer {
    type Handler = TunnelHandler;

    fn new_client(&mut self, _addr: Option<std::net::SocketAddr>) -> Self::Handler {
        TunnelHandler {
            direct: self.direct.clone(),
            forwards: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

struct TunnelHandler {
    direct: Arc<Mutex<Vec<String>>>,
    forwards: Arc<Mutex<HashMap<u32, JoinHandle<()>>>>,
}

impl Drop for TunnelHandler {
    fn drop(&mut self) {
        for (_, task) in self.forwards.lock().unwrap().drain() {
            task.abort();
        }
    }
}

impl server::Handler for TunnelHandler {
    type Error = anyhow::Error;

    fn auth_password(&mut self, user: &str, password: &str) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        let accepted = user == "testuser" && password == PASSWORD;
        async move { Ok(if accepted { Auth::Accept } else { Auth::reject() }) }
    }

    fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<server::Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let host = host_to_connect.to_string();
        self.direct.lock().unwrap().push(format!("{host}:{port_to_connect}"));
        async move {
            let port = u16::try_from(port_to_connect)?;
            let Ok(mut upstream) = TcpStream::connect((host.as_str(), port)).await else {
                return Ok(false);
            };
            tokio::spawn(async move {
                let mut stream = channel.into_stream();
                let _ = copy_bidirectional(&mut stream, &mut upstream).await;
            });
            Ok(true)
        }
    }

    fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let handle = session.handle();
        let address = address.to_string();
        let forwards = self.forwards.clone();
        async move {
            let Ok(listener) = TcpListener::bind((address.as_str(), u16::try_from(*port)?)).await else {
                return Ok(false);
            };
            *port = u32::from(listener.local_addr()?.port());
            let bound = *port;
            let task = tokio::spawn(async move {
                while let Ok((mut inbound, peer)) = listener.accept().await {
                    let handle = handle.clone();
                    let address = address.clone();
                    tokio::spawn(async move {
                        let opened = handle
                            .channel_open_forwarded_tcpip(address, bound, peer.ip().to_string(), u32::from(peer.port()))
                            .await;
                        if let Ok(channel) = opened {
                            let mut stream = channel.into_stream();
                            let _ = copy_bidirectional(&mut inbound, &mut stream).await;
                        }
                    });
                }
            });
            forwards.lock().unwrap().insert(bound, task);
            Ok(true)
        }
    }

    fn cancel_tcpip_forward(&mut self, _address: &str, port: u32, _session: &mut Session) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let cancelled = self.forwards.lock().unwrap().remove(&port).map(|task| task.abort()).is_some();
        async move { Ok(cancelled) }
    }
}
