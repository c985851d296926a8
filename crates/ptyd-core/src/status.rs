use nix::sys::signal::Signal;

/// Terminal state of a shell session, as collected by the connection
/// supervisor.
///
/// A session that ends because its terminal hung up (the peer went away)
/// reports `Signaled(SIGHUP)`; that is an orderly outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The shell exited normally with the given code.
    Exited(i32),
    /// The shell was terminated by a signal.
    Signaled(Signal),
}

impl SessionStatus {
    /// Returns `true` when the session ended with exit code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Returns the exit code when the shell exited normally.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_code() {
        assert!(SessionStatus::Exited(0).success());
        assert!(!SessionStatus::Exited(1).success());
        assert!(!SessionStatus::Signaled(Signal::SIGHUP).success());

        assert_eq!(SessionStatus::Exited(127).code(), Some(127));
        assert_eq!(SessionStatus::Signaled(Signal::SIGHUP).code(), None);
    }
}
