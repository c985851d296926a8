//! Core server: binds the TCP listener and dispatches accepted connections.
//!
//! Each connection is handled to completion in its own spawned task, so a
//! stalled or failed session never blocks the acceptor or other sessions.

use crate::config::ServerConfig;
use crate::session::supervisor;
use ptyd_core::{PtydError, PtydResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{info, warn};

/// Listen backlog, sized for an interactive service.
const LISTEN_BACKLOG: u32 = 10;

/// The ptyd server instance.
pub struct PtydServer {
    config: ServerConfig,
    listener: TcpListener,
}

impl PtydServer {
    /// Bind the listener. This is the only setup step that can fail the
    /// whole process.
    pub async fn bind(config: ServerConfig) -> PtydResult<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
            .parse()
            .map_err(|e| PtydError::Config(format!("invalid listen address: {e}")))?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!(error = %e, "setsockopt(SO_REUSEADDR) failed");
        }
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self { config, listener })
    }

    /// Address the listener actually bound (the OS picks the port when the
    /// configured port is 0).
    pub fn local_addr(&self) -> PtydResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and hand each one to a supervisor task.
    pub async fn run(self) -> PtydResult<()> {
        info!(addr = %self.local_addr()?, "ptyd-server ready");

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    // A failed accept must not take the service down.
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            info!(peer = %peer, "connection accepted");
            let session_config = self.config.session.clone();
            tokio::spawn(async move {
                match supervisor::handle(stream, session_config).await {
                    Ok(status) => info!(peer = %peer, status = ?status, "session ended"),
                    Err(e) => warn!(peer = %peer, error = %e, "connection failed"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn start_server() -> SocketAddr {
        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            session: SessionConfig {
                shell: PathBuf::from("/bin/sh"),
                home: None,
            },
        };
        let server = PtydServer::bind(config).await.expect("bind failed");
        let addr = server.local_addr().expect("local addr");
        tokio::spawn(server.run());
        addr
    }

    /// Drive one shell session over TCP: send a command whose output does
    /// not appear in the echoed input, and wait for that output.
    async fn run_echo_session(addr: SocketAddr, marker: &str) {
        let mut client = TcpStream::connect(addr).await.expect("connect failed");

        let command = format!("echo {}_$((40+2))\n", marker);
        client
            .write_all(command.as_bytes())
            .await
            .expect("client write");

        let expected = format!("{}_42", marker);
        let mut collected = Vec::new();
        let mut buf = [0u8; 512];
        timeout(Duration::from_secs(15), async {
            loop {
                let n = client.read(&mut buf).await.expect("client read");
                assert_ne!(n, 0, "connection closed before output arrived");
                collected.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&collected).contains(&expected) {
                    break;
                }
            }
        })
        .await
        .expect("no shell output within deadline");

        client.write_all(b"exit\n").await.expect("client write");
    }

    #[tokio::test]
    async fn end_to_end_shell_session() {
        let addr = start_server().await;
        run_echo_session(addr, "hi").await;
    }

    #[tokio::test]
    async fn concurrent_sessions_are_isolated() {
        let addr = start_server().await;

        // One hung connection (never writes) must not block another.
        let hung = TcpStream::connect(addr).await.expect("connect failed");

        run_echo_session(addr, "second").await;
        drop(hung);
    }
}
