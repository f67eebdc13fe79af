// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// In-band resource manager status, as written back into the `status` field
/// of every escape parameter block.
/// Value 0 = success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvStatus(pub u32);

impl NvStatus {
    pub const OK: Self = Self(0);

    /// Check if this is a success status.
    #[inline]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Check if this is an error status.
    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Raw u32 value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Short symbolic name, if the code is one the client knows about.
    pub const fn name(self) -> Option<&'static str> {
        Some(match self {
            NV_OK => "NV_OK",
            NV_ERR_GENERIC => "NV_ERR_GENERIC",
            NV_ERR_INSUFFICIENT_RESOURCES => "NV_ERR_INSUFFICIENT_RESOURCES",
            NV_ERR_INVALID_ARGUMENT => "NV_ERR_INVALID_ARGUMENT",
            NV_ERR_INVALID_CLASS => "NV_ERR_INVALID_CLASS",
            NV_ERR_INVALID_OBJECT_HANDLE => "NV_ERR_INVALID_OBJECT_HANDLE",
            NV_ERR_INVALID_OBJECT_PARENT => "NV_ERR_INVALID_OBJECT_PARENT",
            NV_ERR_INVALID_STATE => "NV_ERR_INVALID_STATE",
            NV_ERR_LIB_RM_VERSION_MISMATCH => "NV_ERR_LIB_RM_VERSION_MISMATCH",
            NV_ERR_NO_MEMORY => "NV_ERR_NO_MEMORY",
            NV_ERR_NOT_SUPPORTED => "NV_ERR_NOT_SUPPORTED",
            NV_ERR_OBJECT_NOT_FOUND => "NV_ERR_OBJECT_NOT_FOUND",
            NV_ERR_STATE_IN_USE => "NV_ERR_STATE_IN_USE",
            _ => return None,
        })
    }
}

impl std::fmt::Debug for NvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "NvStatus::{name}"),
            None => write!(f, "NvStatus(0x{:08X})", self.0),
        }
    }
}

impl std::error::Error for NvStatus {}

impl std::fmt::Display for NvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "unknown status 0x{:08X}", self.0),
        }
    }
}

pub const NV_OK: NvStatus = NvStatus(0x0000_0000);
pub const NV_ERR_INSUFFICIENT_RESOURCES: NvStatus = NvStatus(0x0000_001A);
pub const NV_ERR_INVALID_ARGUMENT: NvStatus = NvStatus(0x0000_001F);
pub const NV_ERR_INVALID_CLASS: NvStatus = NvStatus(0x0000_0022);
pub const NV_ERR_INVALID_OBJECT_HANDLE: NvStatus = NvStatus(0x0000_0033);
pub const NV_ERR_INVALID_OBJECT_PARENT: NvStatus = NvStatus(0x0000_0036);
pub const NV_ERR_INVALID_STATE: NvStatus = NvStatus(0x0000_0040);
pub const NV_ERR_LIB_RM_VERSION_MISMATCH: NvStatus = NvStatus(0x0000_0041);
pub const NV_ERR_NO_MEMORY: NvStatus = NvStatus(0x0000_0051);
pub const NV_ERR_NOT_SUPPORTED: NvStatus = NvStatus(0x0000_0056);
pub const NV_ERR_OBJECT_NOT_FOUND: NvStatus = NvStatus(0x0000_0057);
pub const NV_ERR_STATE_IN_USE: NvStatus = NvStatus(0x0000_0062);
pub const NV_ERR_GENERIC: NvStatus = NvStatus(0x0000_FFFF);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok() {
        assert!(NV_OK.is_ok());
        assert!(!NV_OK.is_error());
        assert_eq!(NvStatus::OK, NV_OK);
    }

    #[test]
    fn test_display_known_and_unknown() {
        assert_eq!(
            NV_ERR_INVALID_ARGUMENT.to_string(),
            "NV_ERR_INVALID_ARGUMENT (0x0000001F)"
        );
        assert_eq!(NvStatus(0x1234).to_string(), "unknown status 0x00001234");
        assert_eq!(format!("{:?}", NV_ERR_GENERIC), "NvStatus::NV_ERR_GENERIC");
    }
}
