//! SOCKS5 server engine.
//!
//! One [`Socks5Server`] owns a loopback listener, an accept task and the
//! connection table. The engine is the unit the tunnel supervisor starts,
//! stops and probes; handshake failures only bump the failure counter, and
//! the engine is marked `Failed` only when its listener cannot be bound.

use crate::conn::{self, ConnContext};
use crate::stats::{ConnectionTable, ProxyStats, StatsSnapshot};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `stop()` waits for the accept task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause after a transient accept error.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Stopped,
    Starting,
    Running,
    Failed,
    Unhealthy,
}

impl EngineStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, EngineStatus::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EngineStatus::Failed)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineStatus::Stopped => "Stopped",
            EngineStatus::Starting => "Starting",
            EngineStatus::Running => "Running",
            EngineStatus::Failed => "Failed",
            EngineStatus::Unhealthy => "Unhealthy",
        };
        write!(f, "{}", name)
    }
}

/// Username/password pair for RFC 1929 authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Compare both fields against a submitted pair.
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address to bind (loopback in normal operation)
    pub host: String,
    /// Port to bind (0 for auto-assign in tests)
    pub port: u16,
    /// Require RFC 1929 username/password authentication
    pub auth_required: bool,
    /// Credentials checked when authentication is required
    pub credentials: Option<Credentials>,
    /// Reject new clients beyond this many active relays
    pub max_connections: usize,
    /// Relay buffer size per direction
    pub buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1080,
            auth_required: false,
            credentials: None,
            max_connections: 50,
            buffer_size: 8192,
        }
    }
}

/// Point-in-time view of an engine for readers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub status: EngineStatus,
    pub stats: StatsSnapshot,
}

/// SOCKS5 proxy server bound to one local port.
pub struct Socks5Server {
    config: Arc<EngineConfig>,
    stats: Arc<ProxyStats>,
    connections: Arc<ConnectionTable>,
    status: Mutex<EngineStatus>,
    cancel: Mutex<Option<CancellationToken>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Socks5Server {
    /// Create a stopped engine.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(ProxyStats::new()),
            connections: Arc::new(ConnectionTable::new()),
            status: Mutex::new(EngineStatus::Stopped),
            cancel: Mutex::new(None),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the listener and spawn the accept task.
    ///
    /// Returns the bound address (useful when the configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr, EngineError> {
        {
            let mut status = self.status.lock().unwrap();
            if status.is_running() || *status == EngineStatus::Starting {
                return Err(EngineError::AlreadyRunning);
            }
            *status = EngineStatus::Starting;
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(err) => {
                *self.status.lock().unwrap() = EngineStatus::Failed;
                return Err(err);
            }
        };
        let addr = listener.local_addr().map_err(|source| {
            *self.status.lock().unwrap() = EngineStatus::Failed;
            EngineError::BindFailed {
                addr: format!("{}:{}", self.config.host, self.config.port),
                source,
            }
        })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            self.stats.clone(),
            self.connections.clone(),
            cancel.clone(),
        ));

        *self.cancel.lock().unwrap() = Some(cancel);
        *self.accept_task.lock().unwrap() = Some(task);
        *self.local_addr.lock().unwrap() = Some(addr);
        *self.status.lock().unwrap() = EngineStatus::Running;

        info!(%addr, "SOCKS5 engine listening");
        Ok(addr)
    }

    /// Stop the engine. Idempotent.
    ///
    /// Cancels the accept task (2 s budget, then abort), then closes every
    /// live connection record.
    pub async fn stop(&self) {
        let cancel = self.cancel.lock().unwrap().take();
        let task = self.accept_task.lock().unwrap().take();

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("accept task did not stop in time; aborting");
                task.abort();
            }
        }

        self.connections.close_all(&self.stats);
        *self.local_addr.lock().unwrap() = None;
        *self.status.lock().unwrap() = EngineStatus::Stopped;
        debug!("SOCKS5 engine stopped");
    }

    /// True iff the engine is `Running` and its accept task is alive.
    pub fn is_healthy(&self) -> bool {
        if !self.status.lock().unwrap().is_running() {
            return false;
        }
        self.accept_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Current status.
    pub fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap()
    }

    /// Consistent status-plus-stats copy for readers.
    pub fn snapshot(&self) -> EngineSnapshot {
        let status = self.status.lock().unwrap();
        EngineSnapshot {
            status: *status,
            stats: self.stats.snapshot(),
        }
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Mark the engine unhealthy (probe-driven, from the supervisor).
    pub fn mark_unhealthy(&self) {
        let mut status = self.status.lock().unwrap();
        if status.is_running() {
            *status = EngineStatus::Unhealthy;
        }
    }

    /// Clear a probe-driven unhealthy mark.
    pub fn mark_healthy(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == EngineStatus::Unhealthy {
            *status = EngineStatus::Running;
        }
    }

    async fn bind(&self) -> Result<TcpListener, EngineError> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| EngineError::InvalidAddress {
                addr: format!("{}:{}", self.config.host, self.config.port),
            })?;

        let bind_failed = |source: std::io::Error| EngineError::BindFailed {
            addr: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().map_err(bind_failed)?
        } else {
            TcpSocket::new_v6().map_err(bind_failed)?
        };
        socket.set_reuseaddr(true).map_err(bind_failed)?;
        socket.bind(addr).map_err(bind_failed)?;
        socket.listen(1024).map_err(bind_failed)
    }
}

/// Accept clients until cancelled.
async fn accept_loop(
    listener: TcpListener,
    config: Arc<EngineConfig>,
    stats: Arc<ProxyStats>,
    connections: Arc<ConnectionTable>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    if stats.active() >= config.max_connections as u64 {
                        debug!(%peer, limit = config.max_connections, "connection limit reached, rejecting");
                        stats.record_failure();
                        continue;
                    }
                    stats.record_accept();
                    let id = connections.next_id();
                    let ctx = ConnContext {
                        config: config.clone(),
                        stats: stats.clone(),
                        connections: connections.clone(),
                        cancel: cancel.clone(),
                    };
                    tokio::spawn(conn::handle_client(stream, peer, id, ctx));
                }
                Err(err) => {
                    warn!(error = %err, "accept error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }
    debug!("accept loop exited");
}

/// Engine-level failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid listen address {addr}")]
    InvalidAddress { addr: String },

    #[error("engine is already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Spawn a TCP echo listener and return its address.
    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn start_engine(config: EngineConfig) -> (Socks5Server, SocketAddr) {
        let server = Socks5Server::new(EngineConfig { port: 0, ..config });
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    /// Run the no-auth greeting and CONNECT to `target`, asserting success.
    async fn connect_through(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        match target {
            SocketAddr::V4(v4) => request.extend_from_slice(&v4.ip().octets()),
            SocketAddr::V6(_) => panic!("echo target is IPv4"),
        }
        request.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        client
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_no_auth_round_trip() {
        let echo = spawn_echo().await;
        let (server, addr) = start_engine(EngineConfig::default()).await;

        let mut client = connect_through(addr, echo).await;
        client.write_all(b"PING").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"PING");

        // The live record has seen four bytes in each direction.
        wait_until(|| {
            server.connections.active_count() == 1
                && server.stats.snapshot().total_bytes == 8
        })
        .await;

        drop(client);
        wait_until(|| server.stats.snapshot().active == 0).await;

        let snapshot = server.snapshot();
        assert_eq!(snapshot.stats.total, 1);
        assert_eq!(snapshot.stats.failed, 0);
        assert_eq!(snapshot.stats.total_bytes, 8);
        assert_eq!(snapshot.stats.success_rate(), 100.0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_userpass_success() {
        let echo = spawn_echo().await;
        let (server, addr) = start_engine(EngineConfig {
            auth_required: true,
            credentials: Some(Credentials::new("u", "p")),
            ..Default::default()
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);

        client
            .write_all(&[0x01, 0x01, b'u', 0x01, b'p'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, 0x00]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_userpass_failure_closes() {
        let (server, addr) = start_engine(EngineConfig {
            auth_required: true,
            credentials: Some(Credentials::new("u", "p")),
            ..Default::default()
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);

        client
            .write_all(&[0x01, 0x01, b'u', 0x01, b'x'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        // Server closes after the failure status.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        wait_until(|| server.stats.snapshot().failed == 1).await;

        server.stop().await;
    }

    #[tokio::test]
    async fn test_auth_required_rejects_no_auth_client() {
        let (server, addr) = start_engine(EngineConfig {
            auth_required: true,
            credentials: Some(Credentials::new("u", "p")),
            ..Default::default()
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xFF]);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unsupported_command_reply() {
        let (server, addr) = start_engine(EngineConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_refused_target_reply() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (server, addr) = start_engine(EngineConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&closed_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x05);

        wait_until(|| server.stats.snapshot().failed == 1).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_short_greeting_counts_failed() {
        let (server, addr) = start_engine(EngineConfig::default()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01]).await.unwrap();
        drop(client);

        wait_until(|| server.stats.snapshot().failed == 1).await;
        assert!(server.is_healthy());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let echo = spawn_echo().await;
        let (server, addr) = start_engine(EngineConfig {
            max_connections: 1,
            ..Default::default()
        })
        .await;

        let _held = connect_through(addr, echo).await;
        wait_until(|| server.stats.snapshot().active == 1).await;

        // Second client is accepted by the kernel and dropped by the engine.
        let mut rejected = TcpStream::connect(addr).await.unwrap();
        let _ = rejected.write_all(&[0x05, 0x01, 0x00]).await;
        let mut buf = [0u8; 2];
        assert!(matches!(rejected.read_exact(&mut buf).await, Err(_)));

        wait_until(|| server.stats.snapshot().failed == 1).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_engine() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let held = holder.local_addr().unwrap();

        let server = Socks5Server::new(EngineConfig {
            port: held.port(),
            ..Default::default()
        });
        // SO_REUSEADDR does not allow binding over a live listener.
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, EngineError::BindFailed { .. }));
        assert!(server.status().is_failed());
    }

    #[tokio::test]
    async fn test_stop_under_load() {
        let echo = spawn_echo().await;
        let (server, addr) = start_engine(EngineConfig::default()).await;

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(connect_through(addr, echo).await);
        }
        wait_until(|| server.stats.snapshot().active == 10).await;

        server.stop().await;

        let snapshot = server.snapshot();
        assert_eq!(snapshot.status, EngineStatus::Stopped);
        assert_eq!(snapshot.stats.active, 0);
        assert!(server.connections.is_empty());
        assert!(!server.is_healthy());

        // Stop is idempotent.
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unhealthy_marking() {
        let (server, _) = start_engine(EngineConfig::default()).await;

        server.mark_unhealthy();
        assert_eq!(server.status(), EngineStatus::Unhealthy);
        assert!(!server.is_healthy());

        server.mark_healthy();
        assert_eq!(server.status(), EngineStatus::Running);

        server.stop().await;
        // A stopped engine is not resurrected by probe results.
        server.mark_healthy();
        assert_eq!(server.status(), EngineStatus::Stopped);
    }
}
