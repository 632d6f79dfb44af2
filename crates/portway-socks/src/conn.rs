//! Per-connection protocol driving and byte relay.
//!
//! Each accepted client gets one task running [`handle_client`]: negotiate
//! (30 s deadline), dial the target (10 s deadline, failures mapped to RFC
//! 1928 reply codes), then relay bytes in both directions until EOF, error,
//! shutdown or the 5-minute inactivity deadline.

use crate::protocol::{self, consts, ConnectRequest, ProtocolError, ReplyCode, TargetAddr};
use crate::server::EngineConfig;
use crate::stats::{ConnectionRecord, ConnectionTable, ProxyStats};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deadline for the whole greeting/auth/request phase.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the outbound dial.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Inactivity deadline while relaying.
const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared engine state handed to each connection task.
pub(crate) struct ConnContext {
    pub config: Arc<EngineConfig>,
    pub stats: Arc<ProxyStats>,
    pub connections: Arc<ConnectionTable>,
    pub cancel: CancellationToken,
}

/// Drive one client connection to completion.
pub(crate) async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    ctx: ConnContext,
) {
    let request = match timeout(NEGOTIATION_TIMEOUT, negotiate(&mut stream, &ctx.config)).await {
        Ok(Ok(request)) => request,
        Ok(Err(err)) => {
            if let Some(code) = err.reply_code() {
                let _ = protocol::write_reply(&mut stream, code).await;
            }
            ctx.stats.record_failure();
            debug!(%peer, error = %err, "handshake failed");
            return;
        }
        Err(_) => {
            ctx.stats.record_failure();
            debug!(%peer, "negotiation deadline expired");
            return;
        }
    };

    let target = match dial(&request).await {
        Ok(target) => target,
        Err(err) => {
            let _ = protocol::write_reply(&mut stream, err.reply_code()).await;
            ctx.stats.record_failure();
            debug!(%peer, target = %request, error = %err, "dial failed");
            return;
        }
    };

    if protocol::write_reply(&mut stream, ReplyCode::Succeeded)
        .await
        .is_err()
    {
        ctx.stats.record_failure();
        return;
    }

    let record = Arc::new(ConnectionRecord::new(
        id,
        peer,
        request.addr.to_string(),
        request.port,
    ));
    ctx.connections.insert(record.clone());
    ctx.stats.record_relay_start();

    debug!(%peer, target = %request, id, "relay established");
    relay(
        stream,
        target,
        &record,
        &ctx.stats,
        ctx.config.buffer_size,
        ctx.cancel.clone(),
    )
    .await;

    if record.close() {
        ctx.stats.record_relay_end();
    }
    ctx.connections.remove(id);
    debug!(
        %peer,
        id,
        sent = record.bytes_sent(),
        received = record.bytes_received(),
        "relay closed"
    );
}

/// Run the greeting, optional RFC 1929 sub-negotiation and request parse.
async fn negotiate(
    stream: &mut TcpStream,
    config: &EngineConfig,
) -> Result<ConnectRequest, ProtocolError> {
    let offered = protocol::read_greeting(stream).await?;
    let method = protocol::select_method(&offered, config.auth_required);
    protocol::write_method_selection(stream, method).await?;

    if method == consts::METHOD_NO_ACCEPTABLE {
        return Err(ProtocolError::NoAcceptableMethod);
    }

    if method == consts::METHOD_USERNAME_PASSWORD {
        let (username, password) = protocol::read_userpass(stream).await?;
        let accepted = config
            .credentials
            .as_ref()
            .is_some_and(|c| c.matches(&username, &password));
        protocol::write_auth_status(stream, accepted).await?;
        if !accepted {
            return Err(ProtocolError::AuthFailed);
        }
    }

    protocol::read_request(stream).await
}

/// Connect to the requested target within the dial deadline.
async fn dial(request: &ConnectRequest) -> Result<TcpStream, DialError> {
    let addr = match &request.addr {
        TargetAddr::Ipv4(ip) => SocketAddr::new((*ip).into(), request.port),
        TargetAddr::Ipv6(ip) => SocketAddr::new((*ip).into(), request.port),
        TargetAddr::Domain(name) => tokio::net::lookup_host((name.as_str(), request.port))
            .await
            .map_err(DialError::Resolve)?
            .next()
            .ok_or(DialError::NoAddress)?,
    };

    match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) if err.kind() == ErrorKind::ConnectionRefused => Err(DialError::Refused(err)),
        Ok(Err(err)) => Err(DialError::Connect(err)),
        Err(_) => Err(DialError::Timeout),
    }
}

/// Copy bytes in both directions until either side ends, an error occurs,
/// shutdown is signalled or the inactivity deadline expires.
async fn relay(
    client: TcpStream,
    target: TcpStream,
    record: &ConnectionRecord,
    stats: &ProxyStats,
    buffer_size: usize,
    cancel: CancellationToken,
) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut target_read, mut target_write) = target.into_split();
    let mut upstream = vec![0u8; buffer_size];
    let mut downstream = vec![0u8; buffer_size];
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(last_activity + RELAY_IDLE_TIMEOUT) => break,
            result = client_read.read(&mut upstream) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if target_write.write_all(&upstream[..n]).await.is_err() {
                        break;
                    }
                    record.add_sent(n as u64);
                    stats.add_bytes(n as u64);
                    last_activity = Instant::now();
                }
            },
            result = target_read.read(&mut downstream) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&downstream[..n]).await.is_err() {
                        break;
                    }
                    record.add_received(n as u64);
                    stats.add_bytes(n as u64);
                    last_activity = Instant::now();
                }
            },
        }
    }

    // Both halves drop here; the sockets close on every exit path.
}

/// Outbound dial failure, carrying the RFC 1928 reply mapping.
#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error("name resolution failed: {0}")]
    Resolve(std::io::Error),

    #[error("name resolved to no addresses")]
    NoAddress,

    #[error("connect timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    Refused(std::io::Error),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),
}

impl DialError {
    fn reply_code(&self) -> ReplyCode {
        match self {
            DialError::Resolve(_) | DialError::NoAddress | DialError::Timeout => {
                ReplyCode::HostUnreachable
            }
            DialError::Refused(_) => ReplyCode::ConnectionRefused,
            DialError::Connect(_) => ReplyCode::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_dial_refused_maps_to_0x05() {
        // Bind then drop a listener so the port is known-closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = ConnectRequest {
            addr: TargetAddr::Ipv4(Ipv4Addr::LOCALHOST),
            port,
        };
        let err = dial(&request).await.unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_dial_unresolvable_maps_to_0x04() {
        let request = ConnectRequest {
            addr: TargetAddr::Domain("portway-test-unresolvable.invalid".into()),
            port: 80,
        };
        let err = dial(&request).await.unwrap_err();
        assert_eq!(err.reply_code(), ReplyCode::HostUnreachable);
    }
}
