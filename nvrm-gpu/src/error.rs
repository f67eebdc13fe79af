// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use nvrm_client::RmError;
use nvrm_common::status::{self, NvStatus};
use thiserror::Error;

use crate::exec_ctx::ContextState;

/// Errors returned by the submission engine.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error(transparent)]
    Rm(#[from] RmError),

    #[error("no usable GPU found")]
    NoDevice,

    #[error("no supported GPU architecture in the device class list")]
    UnsupportedArch,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The allocator negotiated a different page kind than requested.
    #[error("page kind mismatch: requested 0x{requested:02X}, negotiated 0x{negotiated:02X}")]
    KindMismatch { requested: u32, negotiated: u32 },

    #[error("virtual range already has memory bound")]
    AlreadyBound,

    #[error("out of GPU virtual address space (requested 0x{size:X})")]
    OutOfVa { size: u64 },

    #[error("GPU VA range [0x{addr:X}..+0x{size:X}) is not free")]
    VaOverlap { addr: u64, size: u64 },

    #[error("GPFIFO ring full ({capacity} entries)")]
    RingFull { capacity: u32 },

    #[error("command buffer full: need {needed} words, {capacity} available")]
    CommandBufferFull { needed: usize, capacity: usize },

    #[error("operation not valid in state {0:?}")]
    InvalidState(ContextState),
}

impl GpuError {
    /// Status reported at the API boundary. Only in-band resource manager
    /// codes and argument checks keep their meaning; everything else is
    /// `NV_ERR_GENERIC`.
    pub fn status(&self) -> NvStatus {
        match self {
            Self::Rm(e) => e.status(),
            Self::InvalidArgument(_) => status::NV_ERR_INVALID_ARGUMENT,
            _ => status::NV_ERR_GENERIC,
        }
    }

    pub fn is_status(&self, status: NvStatus) -> bool {
        matches!(self, Self::Rm(e) if e.is_status(status))
    }
}

/// Result alias for submission engine operations.
pub type GpuResult<T> = Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_collapses_to_generic() {
        let e = GpuError::Rm(RmError::Status {
            op: "alloc",
            status: status::NV_ERR_LIB_RM_VERSION_MISMATCH,
        });
        assert_eq!(e.status(), status::NV_ERR_LIB_RM_VERSION_MISMATCH);
        assert!(e.is_status(status::NV_ERR_LIB_RM_VERSION_MISMATCH));

        assert_eq!(
            GpuError::InvalidArgument("indices").status(),
            status::NV_ERR_INVALID_ARGUMENT
        );
        assert_eq!(GpuError::AlreadyBound.status(), status::NV_ERR_GENERIC);
        assert_eq!(
            GpuError::RingFull { capacity: 4 }.status(),
            status::NV_ERR_GENERIC
        );
    }

    #[test]
    fn test_display() {
        let e = GpuError::KindMismatch {
            requested: 0x05,
            negotiated: 0x06,
        };
        assert_eq!(
            e.to_string(),
            "page kind mismatch: requested 0x05, negotiated 0x06"
        );
    }
}
