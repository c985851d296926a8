//! Terminal pair allocation.
//!
//! Obtains a controller/follower pseudo-terminal pair and prepares the
//! follower for opening: ownership grant, then unlock. The follower itself
//! is opened later, inside the spawned session process, so only its device
//! path crosses the fork boundary.

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use ptyd_core::{PtydError, PtydResult};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::path::PathBuf;

/// An allocated pseudo-terminal pair.
///
/// The controller descriptor is owned here; dropping it hangs up whatever
/// is attached to the follower side. The follower travels as a device path
/// and is never opened by the allocating process.
#[derive(Debug)]
pub struct TerminalPair {
    /// Controller side, read/write.
    pub controller: OwnedFd,
    /// Device path of the follower side.
    pub follower_path: PathBuf,
}

impl TerminalPair {
    /// Allocate a fresh controller/follower pair.
    ///
    /// After grant and unlock, any process with access to the device path
    /// may open the follower.
    pub fn allocate() -> PtydResult<Self> {
        let controller =
            posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(|e| PtydError::Allocation {
                op: "posix_openpt",
                source: e,
            })?;

        grantpt(&controller).map_err(|e| PtydError::Allocation {
            op: "grantpt",
            source: e,
        })?;

        unlockpt(&controller).map_err(|e| PtydError::Allocation {
            op: "unlockpt",
            source: e,
        })?;

        let follower_path = ptsname_r(&controller)
            .map(PathBuf::from)
            .map_err(|e| PtydError::Allocation {
                op: "ptsname_r",
                source: e,
            })?;

        // SAFETY: into_raw_fd transfers ownership of an open descriptor;
        // it is immediately rewrapped.
        let controller = unsafe { OwnedFd::from_raw_fd(controller.into_raw_fd()) };

        Ok(Self {
            controller,
            follower_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn allocate_yields_openable_follower() {
        let pair = TerminalPair::allocate().expect("pty allocation failed");
        assert!(pair.follower_path.starts_with("/dev"));

        // Granted and unlocked, so this process can open the follower.
        let follower = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pair.follower_path);
        assert!(follower.is_ok(), "follower not openable: {:?}", follower.err());
    }

    #[test]
    fn distinct_pairs_get_distinct_followers() {
        let a = TerminalPair::allocate().expect("first allocation failed");
        let b = TerminalPair::allocate().expect("second allocation failed");
        assert_ne!(a.follower_path, b.follower_path);
    }
}
