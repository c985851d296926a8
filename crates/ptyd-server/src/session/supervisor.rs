//! Connection supervisor: composition root for one accepted connection.
//!
//! Drives the per-connection pipeline: allocate a terminal pair, launch the
//! shell session, run the relay, collect the exit status. A failure before
//! the relay closes the connection without ever starting a session; after
//! the relay the session status is always collected, exactly once.

use crate::config::SessionConfig;
use crate::relay;
use crate::session::launch::launch;
use crate::session::pty::TerminalPair;
use ptyd_core::{PtydResult, SessionStatus};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Handle one accepted connection to completion.
///
/// Exactly one session and one relay pair exist per connection; both are
/// torn down before this returns. Dropping `stream` on an early error
/// closes the connection.
pub async fn handle(stream: TcpStream, config: SessionConfig) -> PtydResult<SessionStatus> {
    let pair = TerminalPair::allocate()?;
    debug!(follower = %pair.follower_path.display(), "pty allocated");

    let mut session = launch(&pair.follower_path, &config.shell, config.home.as_deref())?;

    debug!(pid = %session.pid(), "relaying");
    let outcome = relay::relay(stream, pair.controller).await?;
    debug!(
        peer_to_terminal = ?outcome.peer_to_terminal,
        terminal_to_peer = ?outcome.terminal_to_peer,
        "relay complete"
    );

    // The controller dropped with the relay; the follower side sees that
    // as a hangup and the shell exits if it has not already.
    let status = session.wait().await?;
    if status == SessionStatus::Exited(127) {
        // 127 is the launcher's distinguishable exec-failure status.
        warn!(shell = %config.shell.display(), "session ended with exec failure status");
    }
    info!(pid = %session.pid(), status = ?status, "session exited");

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    fn sh_config() -> SessionConfig {
        SessionConfig {
            shell: PathBuf::from("/bin/sh"),
            home: None,
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.expect("connect"), server.expect("accept").0)
    }

    #[tokio::test]
    async fn orderly_shell_exit_reports_status_zero() {
        let (mut client, server) = connected_pair().await;
        let task = tokio::spawn(handle(server, sh_config()));

        client.write_all(b"exit 0\n").await.expect("client write");

        let status = timeout(Duration::from_secs(10), task)
            .await
            .expect("session did not end in time")
            .expect("join failed")
            .expect("handle failed");
        assert_eq!(status, SessionStatus::Exited(0));
    }

    #[tokio::test]
    async fn peer_disconnect_ends_session_within_grace_period() {
        let (client, server) = connected_pair().await;
        let task = tokio::spawn(handle(server, sh_config()));

        // Peer vanishes mid-session with no further writes.
        drop(client);

        let result = timeout(Duration::from_secs(10), task)
            .await
            .expect("session did not end in time")
            .expect("join failed");
        // The shell is hung up, not failed; the outcome is non-error.
        assert!(result.is_ok(), "expected non-error outcome: {result:?}");
    }
}
