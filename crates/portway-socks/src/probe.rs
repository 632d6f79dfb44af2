//! Staged SOCKS5 health probe.
//!
//! A stateless client that validates a SOCKS5 server in three cumulative
//! stages: TCP reachability, method negotiation, and a full CONNECT to a
//! canary target. Each stage runs only if the previous one passed, so
//! `full_connection` passing implies the other two.

use crate::protocol::consts;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const CONNECT_STAGE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_STAGE_TIMEOUT: Duration = Duration::from_secs(10);
const FULL_STAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of one probe run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeReport {
    pub basic_connectivity: bool,
    pub handshake: bool,
    pub full_connection: bool,
    pub response_time: Duration,
}

impl ProbeReport {
    /// All three stages passed.
    pub fn overall_healthy(&self) -> bool {
        self.basic_connectivity && self.handshake && self.full_connection
    }
}

/// Stateless SOCKS5 prober.
///
/// The probe never reads payload past the CONNECT reply; the canary
/// connection is dropped as soon as the reply is validated.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    proxy_host: String,
    proxy_port: u16,
    canary_host: String,
    canary_port: u16,
}

impl HealthProbe {
    pub fn new(
        proxy_host: impl Into<String>,
        proxy_port: u16,
        canary_host: impl Into<String>,
        canary_port: u16,
    ) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            canary_host: canary_host.into(),
            canary_port,
        }
    }

    /// Run the three stages and report.
    pub async fn run(&self) -> ProbeReport {
        let started = Instant::now();
        let mut report = ProbeReport::default();

        let stream = match timeout(CONNECT_STAGE_TIMEOUT, self.connect()).await {
            Ok(Ok(stream)) => {
                report.basic_connectivity = true;
                stream
            }
            _ => {
                report.response_time = started.elapsed();
                debug!(port = self.proxy_port, "probe: TCP connect failed");
                return report;
            }
        };

        let stream = match timeout(HANDSHAKE_STAGE_TIMEOUT, self.handshake(stream)).await {
            Ok(Ok(stream)) => {
                report.handshake = true;
                stream
            }
            _ => {
                report.response_time = started.elapsed();
                debug!(port = self.proxy_port, "probe: handshake failed");
                return report;
            }
        };

        match timeout(FULL_STAGE_TIMEOUT, self.full_connection(stream)).await {
            Ok(Ok(())) => report.full_connection = true,
            _ => debug!(port = self.proxy_port, "probe: canary CONNECT failed"),
        }

        report.response_time = started.elapsed();
        report
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect((self.proxy_host.as_str(), self.proxy_port)).await
    }

    /// Send `05 01 00`, expect `05 00`.
    async fn handshake(&self, mut stream: TcpStream) -> std::io::Result<TcpStream> {
        stream
            .write_all(&[consts::SOCKS5_VERSION, 0x01, consts::METHOD_NO_AUTH])
            .await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply != [consts::SOCKS5_VERSION, consts::METHOD_NO_AUTH] {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected method selection",
            ));
        }
        Ok(stream)
    }

    /// CONNECT to the canary via `ATYP=DOMAIN`, expect `REP=0x00`.
    async fn full_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let name = self.canary_host.as_bytes();
        let mut request = Vec::with_capacity(7 + name.len());
        request.extend_from_slice(&[
            consts::SOCKS5_VERSION,
            consts::CMD_CONNECT,
            0x00,
            consts::ATYP_DOMAIN,
            name.len() as u8,
        ]);
        request.extend_from_slice(name);
        request.extend_from_slice(&self.canary_port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != consts::SOCKS5_VERSION || header[1] != 0x00 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "canary CONNECT rejected",
            ));
        }

        // Drain exactly the bound address and port, nothing further.
        let addr_len = match header[3] {
            consts::ATYP_IPV4 => 4,
            consts::ATYP_IPV6 => 16,
            consts::ATYP_DOMAIN => stream.read_u8().await? as usize,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unknown bound address type",
                ))
            }
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{EngineConfig, Socks5Server};
    use tokio::net::TcpListener;

    async fn spawn_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_probe_all_stages_pass() {
        let canary = spawn_echo().await;
        let server = Socks5Server::new(EngineConfig {
            port: 0,
            ..Default::default()
        });
        let addr = server.start().await.unwrap();

        let probe = HealthProbe::new("127.0.0.1", addr.port(), "127.0.0.1", canary.port());
        let report = probe.run().await;

        assert!(report.basic_connectivity);
        assert!(report.handshake);
        assert!(report.full_connection);
        assert!(report.overall_healthy());
        assert!(report.response_time > Duration::ZERO);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_probe_down_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HealthProbe::new("127.0.0.1", port, "127.0.0.1", 19000);
        let report = probe.run().await;

        assert!(!report.basic_connectivity);
        assert!(!report.handshake);
        assert!(!report.full_connection);
        assert!(!report.overall_healthy());
    }

    #[tokio::test]
    async fn test_probe_stages_cumulative_on_dead_canary() {
        // Canary port is bound then released, so CONNECT inside the proxy
        // fails while reachability and handshake still pass.
        let canary = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let canary_addr = canary.local_addr().unwrap();
        drop(canary);

        let server = Socks5Server::new(EngineConfig {
            port: 0,
            ..Default::default()
        });
        let addr = server.start().await.unwrap();

        let probe = HealthProbe::new(
            "127.0.0.1",
            addr.port(),
            "127.0.0.1",
            canary_addr.port(),
        );
        let report = probe.run().await;

        assert!(report.basic_connectivity);
        assert!(report.handshake);
        assert!(!report.full_connection);
        assert!(!report.overall_healthy());

        server.stop().await;
    }
}
