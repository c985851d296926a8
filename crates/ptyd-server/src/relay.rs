//! Relay engine: bidirectional byte copy between a network connection and a
//! pseudo-terminal controller.
//!
//! Two workers run per connection, one per direction (peer→terminal and
//! terminal→peer). Each is created holding the other's cancel handle; when
//! either direction stops (end-of-stream, error, or cancellation) it signals
//! its peer so the pair tears down together instead of leaving one side
//! parked on a read that will never complete. Within a direction bytes are
//! delivered in the order read; the two directions are independent streams.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use ptyd_core::{PtydError, PtydResult};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bytes moved per read. Input is interactive, so terminal-sized chunks are
/// plenty.
pub const RELAY_CHUNK: usize = 512;

/// How one relay direction came to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The source reached end-of-stream, or the terminal hung up.
    Eof,
    /// The opposite direction stopped first and cancelled this one.
    Cancelled,
    /// A read or write failed.
    Failed,
}

/// Outcome of a completed relay: how each direction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub peer_to_terminal: DirectionEnd,
    pub terminal_to_peer: DirectionEnd,
}

/// Copy bytes between `stream` and the pty `controller` until both
/// directions have stopped.
///
/// The controller closes when the last worker's reference drops on return,
/// which delivers the hangup to the follower side.
pub async fn relay(stream: TcpStream, controller: OwnedFd) -> PtydResult<RelayOutcome> {
    set_nonblocking(&controller)?;
    let controller = Arc::new(AsyncFd::new(controller).map_err(PtydError::Io)?);

    let (net_read, net_write) = stream.into_split();

    // The only cross-worker state: each worker gets its own receiver and
    // the opposite worker's sender, written once before either starts.
    let (cancel_a_tx, cancel_a_rx) = mpsc::channel::<()>(1);
    let (cancel_b_tx, cancel_b_rx) = mpsc::channel::<()>(1);

    let a = tokio::spawn(peer_to_terminal(
        net_read,
        controller.clone(),
        cancel_a_rx,
        cancel_b_tx,
    ));
    let b = tokio::spawn(terminal_to_peer(
        controller,
        net_write,
        cancel_b_rx,
        cancel_a_tx,
    ));

    // The relay is complete once both workers have stopped.
    let peer_to_terminal = a.await.map_err(|e| PtydError::Io(io::Error::other(e)))?;
    let terminal_to_peer = b.await.map_err(|e| PtydError::Io(io::Error::other(e)))?;

    Ok(RelayOutcome {
        peer_to_terminal,
        terminal_to_peer,
    })
}

/// Worker for the peer→terminal direction.
async fn peer_to_terminal(
    mut source: OwnedReadHalf,
    controller: Arc<AsyncFd<OwnedFd>>,
    mut cancel_rx: mpsc::Receiver<()>,
    peer_cancel: mpsc::Sender<()>,
) -> DirectionEnd {
    let mut buf = [0u8; RELAY_CHUNK];

    let end = loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("peer-to-terminal cancelled");
                break DirectionEnd::Cancelled;
            }
            result = source.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("peer closed connection");
                        break DirectionEnd::Eof;
                    }
                    Ok(n) => {
                        if let Err(end) =
                            write_to_controller(&controller, &mut cancel_rx, &buf[..n]).await
                        {
                            break end;
                        }
                    }
                    Err(e) => {
                        let err = PtydError::Transfer {
                            direction: "peer-to-terminal",
                            source: e,
                        };
                        warn!(error = %err, "relay direction failed");
                        break DirectionEnd::Failed;
                    }
                }
            }
        }
    };

    let _ = peer_cancel.try_send(());
    end
}

/// Worker for the terminal→peer direction.
async fn terminal_to_peer(
    controller: Arc<AsyncFd<OwnedFd>>,
    mut sink: OwnedWriteHalf,
    mut cancel_rx: mpsc::Receiver<()>,
    peer_cancel: mpsc::Sender<()>,
) -> DirectionEnd {
    let mut buf = [0u8; RELAY_CHUNK];

    let end = loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("terminal-to-peer cancelled");
                break DirectionEnd::Cancelled;
            }
            readable = controller.readable() => {
                let mut guard = match readable {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(error = %e, "controller not readable");
                        break DirectionEnd::Failed;
                    }
                };
                match guard.try_io(|inner| read_fd(inner.get_ref(), &mut buf)) {
                    Ok(Ok(0)) => {
                        debug!("terminal reached end-of-stream");
                        break DirectionEnd::Eof;
                    }
                    Ok(Ok(n)) => {
                        if let Err(e) = sink.write_all(&buf[..n]).await {
                            let err = PtydError::Transfer {
                                direction: "terminal-to-peer",
                                source: e,
                            };
                            warn!(error = %err, "relay direction failed");
                            break DirectionEnd::Failed;
                        }
                    }
                    Ok(Err(e)) if is_hangup(&e) => {
                        debug!("terminal hung up");
                        break DirectionEnd::Eof;
                    }
                    Ok(Err(e)) => {
                        let err = PtydError::Transfer {
                            direction: "terminal-to-peer",
                            source: e,
                        };
                        warn!(error = %err, "relay direction failed");
                        break DirectionEnd::Failed;
                    }
                    Err(_would_block) => {}
                }
            }
        }
    };

    // Propagate the close to the peer, then stop the opposite worker.
    let _ = sink.shutdown().await;
    let _ = peer_cancel.try_send(());
    end
}

/// Write a full chunk to the controller, retrying partial writes until the
/// chunk is flushed. Cancellation is observed between retries, so a full
/// pty input buffer cannot pin this worker past its peer's termination.
async fn write_to_controller(
    controller: &AsyncFd<OwnedFd>,
    cancel_rx: &mut mpsc::Receiver<()>,
    mut chunk: &[u8],
) -> Result<(), DirectionEnd> {
    while !chunk.is_empty() {
        let mut guard = tokio::select! {
            _ = cancel_rx.recv() => {
                debug!("peer-to-terminal cancelled mid-write");
                return Err(DirectionEnd::Cancelled);
            }
            writable = controller.writable() => match writable {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(error = %e, "controller not writable");
                    return Err(DirectionEnd::Failed);
                }
            }
        };

        match guard.try_io(|inner| write_fd(inner.get_ref(), chunk)) {
            Ok(Ok(n)) => chunk = &chunk[n..],
            Ok(Err(e)) if is_hangup(&e) => {
                debug!("terminal hung up during write");
                return Err(DirectionEnd::Eof);
            }
            Ok(Err(e)) => {
                let err = PtydError::Transfer {
                    direction: "peer-to-terminal",
                    source: e,
                };
                warn!(error = %err, "relay direction failed");
                return Err(DirectionEnd::Failed);
            }
            Err(_would_block) => {}
        }
    }
    Ok(())
}

/// A read or write against a pty whose session side is gone reports EIO
/// (EBADF if the descriptor itself already went away). Both mean the other
/// end of this direction has terminated: normal shutdown, not an error.
fn is_hangup(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EIO) | Some(libc::EBADF))
}

/// Non-blocking read(2) on the controller.
fn read_fd(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: reading into a valid buffer from an open descriptor.
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Non-blocking write(2) on the controller.
fn write_fd(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: writing from a valid buffer to an open descriptor.
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Put the controller into non-blocking mode for use with `AsyncFd`.
fn set_nonblocking(fd: &OwnedFd) -> PtydResult<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| PtydError::Io(io::Error::from_raw_os_error(e as i32)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))
        .map_err(|e| PtydError::Io(io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}
