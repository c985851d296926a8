use nix::errno::Errno;
use thiserror::Error;

/// Errors produced while standing up or running a shell session.
///
/// The variants map onto the stages of the per-connection pipeline:
/// allocation failures abort the connection before any session exists,
/// setup and exec failures end the spawned session process (statuses 1 and
/// 127 respectively), and transfer failures end one relay direction without
/// touching the rest of the server.
#[derive(Debug, Error)]
pub enum PtydError {
    /// Pseudo-terminal allocation failed (open, grant, unlock, or name
    /// resolution). Fatal to the connection; no session is started.
    #[error("pty allocation failed ({op}): {source}")]
    Allocation {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// Follower-device or stdio preparation failed inside the session
    /// process. The process exits with status 1.
    #[error("session setup failed ({op}): {source}")]
    Setup {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// Replacing the session process image with the shell failed. The
    /// process exits with status 127.
    #[error("exec of {shell} failed: {source}")]
    Exec {
        shell: String,
        #[source]
        source: Errno,
    },

    /// Forking the session process failed.
    #[error("failed to spawn session process: {0}")]
    Spawn(#[source] Errno),

    /// Collecting the session exit status failed.
    #[error("failed to wait for session: {0}")]
    Wait(#[source] Errno),

    /// A relay direction failed while copying bytes.
    #[error("transfer failed ({direction}): {source}")]
    Transfer {
        direction: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PtydResult<T> = Result<T, PtydError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_carry_operation_context() {
        let err = PtydError::Allocation {
            op: "grantpt",
            source: Errno::EACCES,
        };
        let msg = err.to_string();
        assert!(msg.contains("grantpt"), "missing op name: {msg}");

        let err = PtydError::Exec {
            shell: "/bin/bash".into(),
            source: Errno::ENOENT,
        };
        assert!(err.to_string().contains("/bin/bash"));

        let err = PtydError::Transfer {
            direction: "peer-to-terminal",
            source: std::io::Error::from_raw_os_error(Errno::EIO as i32),
        };
        assert!(err.to_string().contains("peer-to-terminal"));
    }
}
