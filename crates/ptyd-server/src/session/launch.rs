//! Session launch: turns an allocated follower device into an interactive
//! login shell.
//!
//! `launch` forks. The child becomes a session leader, opens the follower
//! as its controlling terminal, ensures the canonical line discipline is
//! attached, rebinds its standard streams, drops every other inherited
//! descriptor, and execs the shell. On success the child never returns into
//! this code; on failure it dies with status 1 (setup) or 127 (exec), which
//! the parent observes through [`SessionHandle::wait`].
//!
//! Everything the child needs on the heap (CStrings, the resolved home
//! directory) is prepared before the fork; after the fork the child only
//! makes async-signal-safe calls.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use ptyd_core::{PtydError, PtydResult, SessionStatus};
use std::ffi::{CStr, CString};
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{info, warn};

/// Written to the session's stderr (the follower, after the stdio rebind)
/// when entering the home directory fails, so the remote user sees it.
/// Prepared as a constant because the child must not format after forking.
const CHDIR_WARNING: &[u8] = b"ptyd: warning: could not enter home directory\r\n";

/// A running shell session.
///
/// The exit status is collected exactly once and cached; `Drop` kills and
/// reaps the session only if it was never waited on.
pub struct SessionHandle {
    pid: Pid,
    status: Option<SessionStatus>,
}

/// Launch a login shell with `follower_path` as its controlling terminal.
pub fn launch(
    follower_path: &Path,
    shell: &Path,
    home: Option<&Path>,
) -> PtydResult<SessionHandle> {
    let follower_c = cstring_from_path(follower_path)?;
    let shell_c = cstring_from_path(shell)?;
    // Invoked as a login shell, the way a login(1)-style service would.
    let argv = [shell_c.clone(), c"-l".to_owned()];
    let home_c = match home {
        Some(h) => Some(cstring_from_path(h)?),
        None => None,
    };

    // SAFETY: the child runs only the async-signal-safe sequence in
    // `session_child` before exec; all allocations were made above.
    match unsafe { fork() }.map_err(PtydError::Spawn)? {
        ForkResult::Child => {
            let code = session_child(&follower_c, &shell_c, &argv, home_c.as_deref());
            // Never fall through into the server's code from a failed child.
            // SAFETY: _exit is safe to call from the forked child.
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => {
            info!(pid = %child, shell = %shell.display(), "session launched");
            Ok(SessionHandle {
                pid: child,
                status: None,
            })
        }
    }
}

/// Child-side setup. Returns the status to die with; on success the call
/// never returns because the process image is replaced by the shell.
fn session_child(
    follower: &CStr,
    shell: &CStr,
    argv: &[CString],
    home: Option<&CStr>,
) -> i32 {
    // New session: this process becomes the session leader, so the follower
    // it opens next can become its controlling terminal.
    if setsid().is_err() {
        return 1;
    }

    // SAFETY: open(2) on a NUL-terminated path prepared before the fork.
    let fd = unsafe { libc::open(follower.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return 1;
    }

    // The first tty opened by a session leader becomes its controlling
    // terminal on most systems; the ioctl covers the rest. Best effort.
    // SAFETY: TIOCSCTTY is a valid ioctl on a tty descriptor.
    unsafe {
        libc::ioctl(fd, libc::c_ulong::from(libc::TIOCSCTTY), 0);
    }

    // SAFETY: fd stays open for the duration of this borrow.
    let follower_fd = unsafe { BorrowedFd::borrow_raw(fd) };
    if prepare_line_discipline(follower_fd).is_err() {
        return 1;
    }

    // SAFETY: dup2 onto the standard descriptors before exec.
    unsafe {
        if libc::dup2(fd, libc::STDIN_FILENO) < 0
            || libc::dup2(fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(fd, libc::STDERR_FILENO) < 0
        {
            return 1;
        }
    }

    // Everything above stderr is an inherited descriptor (listener,
    // connection, controller) that must not leak into the shell. This also
    // closes the original follower descriptor.
    close_above_stderr();

    if let Some(home) = home {
        // Non-fatal: the shell still launches, from whatever directory the
        // server ran in. The warning lands on the follower.
        // SAFETY: chdir and write on buffers prepared before the fork.
        unsafe {
            if libc::chdir(home.as_ptr()) != 0 {
                libc::write(
                    libc::STDERR_FILENO,
                    CHDIR_WARNING.as_ptr().cast(),
                    CHDIR_WARNING.len(),
                );
            }
        }
    }

    // Replaces the process image on success.
    let _ = nix::unistd::execv(shell, argv);
    127
}

/// Ensure the canonical line-discipline flags are attached to a follower
/// device, probing first so an already-prepared device is left untouched.
///
/// Returns `true` when the flags were applied, `false` when the device was
/// already prepared.
pub fn prepare_line_discipline(fd: BorrowedFd<'_>) -> PtydResult<bool> {
    let mut term = termios::tcgetattr(fd).map_err(|e| PtydError::Setup {
        op: "tcgetattr",
        source: e,
    })?;

    let local = LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG;
    let input = InputFlags::ICRNL;
    let output = OutputFlags::OPOST | OutputFlags::ONLCR;

    if term.local_flags.contains(local)
        && term.input_flags.contains(input)
        && term.output_flags.contains(output)
    {
        return Ok(false);
    }

    term.local_flags.insert(local);
    term.input_flags.insert(input);
    term.output_flags.insert(output);
    termios::tcsetattr(fd, SetArg::TCSANOW, &term).map_err(|e| PtydError::Setup {
        op: "tcsetattr",
        source: e,
    })?;

    Ok(true)
}

/// Close every descriptor above stderr. Uses close_range(2) where
/// available, with a bounded sweep as fallback.
fn close_above_stderr() {
    #[cfg(target_os = "linux")]
    // SAFETY: only touches descriptors above the standard streams.
    let done = unsafe { libc::close_range(3, libc::c_uint::MAX, 0) } == 0;
    #[cfg(not(target_os = "linux"))]
    let done = false;

    if !done {
        // SAFETY: close on descriptors this process may hold; EBADF is
        // ignored.
        unsafe {
            let max = libc::sysconf(libc::_SC_OPEN_MAX);
            let max = if max < 0 { 1024 } else { max as libc::c_int };
            for fd in 3..max {
                libc::close(fd);
            }
        }
    }
}

impl SessionHandle {
    /// The session's process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Wait for the session to reach a terminal state.
    ///
    /// The status is collected once; later calls return the cached value.
    pub async fn wait(&mut self) -> PtydResult<SessionStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let pid = self.pid;
        let status = tokio::task::spawn_blocking(move || reap(pid))
            .await
            .map_err(|e| PtydError::Io(std::io::Error::other(e)))??;
        self.status = Some(status);
        Ok(status)
    }

    /// Non-blocking status check; caches a terminal state when one is seen.
    fn try_wait(&mut self) -> Option<SessionStatus> {
        if self.status.is_some() {
            return self.status;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.status = Some(SessionStatus::Exited(code));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.status = Some(SessionStatus::Signaled(sig));
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => {
                // Already reaped.
                self.status = Some(SessionStatus::Exited(0));
            }
            Err(_) => {}
        }
        self.status
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Backstop for early-return paths: a session that was never waited
        // on must not linger past its connection.
        if self.try_wait().is_none() {
            warn!(pid = %self.pid, "session still running at teardown, sending SIGKILL");
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Block until `pid` reaches a terminal state.
fn reap(pid: Pid) -> PtydResult<SessionStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(SessionStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(SessionStatus::Signaled(sig)),
            // Stopped/continued states are not terminal; keep waiting.
            Ok(_) => continue,
            // Already reaped; treat as an orderly exit.
            Err(Errno::ECHILD) => return Ok(SessionStatus::Exited(0)),
            Err(e) => return Err(PtydError::Wait(e)),
        }
    }
}

/// Convert a path to a `CString` for use across the fork boundary.
fn cstring_from_path(path: &Path) -> PtydResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| PtydError::Config(format!("path contains a NUL byte: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::TerminalPair;
    use std::fs::OpenOptions;
    use std::os::fd::AsFd;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn line_discipline_preparation_is_idempotent() {
        let pair = TerminalPair::allocate().expect("pty allocation failed");
        let follower = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pair.follower_path)
            .expect("open follower");

        prepare_line_discipline(follower.as_fd()).expect("first preparation failed");
        let second = prepare_line_discipline(follower.as_fd()).expect("second preparation failed");
        assert!(!second, "second preparation must be a no-op");
    }

    #[tokio::test]
    async fn session_exit_status_is_collected_once() {
        let pair = TerminalPair::allocate().expect("pty allocation failed");
        let mut handle =
            launch(&pair.follower_path, Path::new("/bin/sh"), None).expect("launch failed");

        // Terminal input arrives through the controller.
        nix::unistd::write(&pair.controller, b"exit 7\n").expect("write to controller");

        let status = timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("session did not exit in time")
            .expect("wait failed");
        assert_eq!(status, SessionStatus::Exited(7));

        // Second wait returns the cached status instead of reaping again.
        let again = handle.wait().await.expect("cached wait failed");
        assert_eq!(again, status);
    }

    #[tokio::test]
    async fn exec_failure_surfaces_as_127() {
        let pair = TerminalPair::allocate().expect("pty allocation failed");
        let mut handle = launch(
            &pair.follower_path,
            Path::new("/nonexistent/shell"),
            None,
        )
        .expect("launch failed");

        let status = timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("session did not exit in time")
            .expect("wait failed");
        assert_eq!(status, SessionStatus::Exited(127));
    }
}
