// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use nvrm_common::status::{self, NvStatus};
use thiserror::Error;

use crate::transport::{Errno, Escape};

/// Errors returned by [`crate::RmClient`] operations.
#[derive(Debug, Error)]
pub enum RmError {
    /// The transport itself failed (process-level errno). Never retried
    /// except for `EINTR`/`EAGAIN`.
    #[error("driver call {escape:?} failed: {errno}")]
    Transport { escape: Escape, errno: Errno },

    /// The resource manager rejected the request in-band.
    #[error("{op} failed: {status}")]
    Status { op: &'static str, status: NvStatus },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("malformed {0} reply: {1}")]
    Malformed(&'static str, std::io::Error),

    #[error("mapping failed: {0}")]
    Io(#[from] std::io::Error),
}

impl RmError {
    /// Status code that best describes this error. Anything that is not an
    /// in-band status collapses to `NV_ERR_GENERIC`.
    pub fn status(&self) -> NvStatus {
        match self {
            Self::Status { status, .. } => *status,
            Self::InvalidArgument(_) => status::NV_ERR_INVALID_ARGUMENT,
            _ => status::NV_ERR_GENERIC,
        }
    }

    pub fn is_status(&self, status: NvStatus) -> bool {
        matches!(self, Self::Status { status: s, .. } if *s == status)
    }
}

/// Result alias for resource manager calls.
pub type RmResult<T> = Result<T, RmError>;

/// Turn an in-band status into a result.
pub(crate) fn check(op: &'static str, raw: u32) -> RmResult<()> {
    let status = NvStatus(raw);
    if status.is_ok() {
        Ok(())
    } else {
        Err(RmError::Status { op, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e = RmError::Transport {
            escape: Escape::RmAlloc,
            errno: Errno::EIO,
        };
        assert_eq!(e.status(), status::NV_ERR_GENERIC);

        let e = RmError::Status {
            op: "alloc",
            status: status::NV_ERR_NO_MEMORY,
        };
        assert_eq!(e.status(), status::NV_ERR_NO_MEMORY);
        assert!(e.is_status(status::NV_ERR_NO_MEMORY));
        assert!(!e.is_status(status::NV_ERR_GENERIC));

        assert_eq!(
            RmError::InvalidArgument("x").status(),
            status::NV_ERR_INVALID_ARGUMENT
        );
    }

    #[test]
    fn test_check() {
        assert!(check("free", 0).is_ok());
        let err = check("free", 0x33).unwrap_err();
        assert_eq!(err.to_string(), "free failed: NV_ERR_INVALID_OBJECT_HANDLE (0x00000033)");
    }
}
