//! Refresh scheduler: dirty bitmask plus self-pipe wake (spec §4.6).
//!
//! `queue_refresh` can be called from the protocol parser (an event just
//! arrived) or from inside the reconciler itself (a pass discovered it
//! needs to re-run some other pass too, or failed and must retry). Either
//! way it only ORs bits into the mask and, if the mask was empty, wakes the
//! owning event loop once by writing a single byte down the self-pipe —
//! exactly the self-pipe trick also used for SIGCHLD in [`crate::process`],
//! just triggered from Rust code instead of a signal handler.

use std::cell::Cell;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::unistd::pipe;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyFlags(u8);

impl DirtyFlags {
    pub const NONE: Self = Self(0);
    pub const SESSIONS: Self = Self(1 << 0);
    pub const WINDOWS: Self = Self(1 << 1);
    pub const PANES: Self = Self(1 << 2);
    pub const CLIENTS: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for DirtyFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

pub struct RefreshScheduler {
    mask: Cell<DirtyFlags>,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl RefreshScheduler {
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        crate::rdavail::set_nonblocking(read_fd.as_raw_fd())?;
        crate::rdavail::set_nonblocking(write_fd.as_raw_fd())?;
        Ok(Self {
            mask: Cell::new(DirtyFlags::NONE),
            read_fd,
            write_fd,
        })
    }

    /// Raw fd to register with the event loop for `Interest::READ`.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// ORs `flags` into the pending mask, waking the loop if it was idle.
    pub fn queue_refresh(&self, flags: DirtyFlags) {
        if flags.is_empty() {
            return;
        }
        let was_empty = self.mask.get().is_empty();
        let mut mask = self.mask.get();
        mask |= flags;
        self.mask.set(mask);
        if was_empty {
            self.wake();
        }
    }

    fn wake(&self) {
        // SAFETY: writing a single byte to our own pipe's write end.
        let res = unsafe {
            libc::write(self.write_fd.as_raw_fd(), [1u8].as_ptr() as *const libc::c_void, 1)
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(%err, "failed to write refresh-scheduler wake byte");
            }
        }
    }

    /// Drains the self-pipe and returns (and clears) the current mask. Call
    /// this from the fd event source's callback; any bits the caller fails
    /// to fully act on should be re-queued via [`Self::queue_refresh`].
    pub fn take_pending(&self) -> DirtyFlags {
        let _ = crate::rdavail::read_available(
            self.read_fd(),
            crate::rdavail::Destination::Discard,
        );
        self.mask.replace(DirtyFlags::NONE)
    }
}
