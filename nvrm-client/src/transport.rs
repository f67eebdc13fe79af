// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The privileged side of the resource manager, seen as an opaque RPC
//! channel.
//!
//! Every request is a single fixed-layout parameter block passed through
//! [`RmTransport::ioctl`]; the transport writes results back into the same
//! buffer. Transport-level failure is reported as an errno, in-band failure
//! through the block's own `status` field.

use std::io;
use std::time::Duration;

use crate::mapping::CpuMapping;

/// Escape codes understood by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Escape {
    RmFree = 0x29,
    RmControl = 0x2A,
    RmAlloc = 0x2B,
    RmMapMemory = 0x4E,
    RmUnmapMemory = 0x4F,
    RmMapMemoryDma = 0x57,
    RmUnmapMemoryDma = 0x58,
    CardInfo = 0xC8,
    AllocOsEvent = 0xCE,
    FreeOsEvent = 0xCF,
    CheckVersionStr = 0xD2,
}

impl Escape {
    pub const ALL: [Escape; 11] = [
        Self::RmFree,
        Self::RmControl,
        Self::RmAlloc,
        Self::RmMapMemory,
        Self::RmUnmapMemory,
        Self::RmMapMemoryDma,
        Self::RmUnmapMemoryDma,
        Self::CardInfo,
        Self::AllocOsEvent,
        Self::FreeOsEvent,
        Self::CheckVersionStr,
    ];

    pub fn nr(self) -> u32 {
        self as u32
    }

    pub fn from_nr(nr: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.nr() == nr)
    }
}

/// Process-level error number returned by a failed transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EINTR: Self = Self(4);
    pub const EIO: Self = Self(5);
    pub const EAGAIN: Self = Self(11);
    pub const ENOMEM: Self = Self(12);
    pub const EFAULT: Self = Self(14);
    pub const EINVAL: Self = Self(22);

    /// Whether the call should simply be issued again.
    pub fn is_transient(self) -> bool {
        self == Self::EINTR || self == Self::EAGAIN
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// OS-level notification descriptor (a private control-node file descriptor
/// the resource manager can signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventFd(pub i32);

impl EventFd {
    /// Value passed to the resource manager as a waiter's notification handle.
    pub fn notification_handle(self) -> u64 {
        self.0 as u64
    }
}

/// Trait for the kernel-resident resource manager endpoint.
pub trait RmTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Issue one escape. `params` holds the complete request and receives the
    /// reply in place.
    fn ioctl(&self, escape: Escape, params: &mut [u8]) -> Result<(), Errno>;

    /// Create the process-local CPU view of a mapping previously set up with
    /// [`Escape::RmMapMemory`], identified by the linear address it returned.
    fn mmap(&self, linear_address: u64, length: u64) -> io::Result<CpuMapping>;

    /// Open a private notification descriptor.
    fn open_event(&self) -> io::Result<EventFd>;

    /// Close a descriptor returned by [`RmTransport::open_event`].
    fn close_event(&self, fd: EventFd);

    /// Wait up to `timeout` for `fd` to become readable. Returns `true` if it
    /// did; a `true` return does not guarantee the awaited condition holds.
    fn poll_event(&self, fd: EventFd, timeout: Duration) -> io::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trips_through_nr() {
        for escape in Escape::ALL {
            assert_eq!(Escape::from_nr(escape.nr()), Some(escape));
        }
        assert_eq!(Escape::from_nr(0x1234), None);
    }

    #[test]
    fn test_transient_errno() {
        assert!(Errno::EINTR.is_transient());
        assert!(Errno::EAGAIN.is_transient());
        assert!(!Errno::EINVAL.is_transient());
    }
}
