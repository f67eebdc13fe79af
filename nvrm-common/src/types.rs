// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Resource manager object handle (opaque, client-scoped).
pub type Handle = u32;

/// GPU virtual address.
pub type GpuVa = u64;

/// Null handle. Freeing it is a successful no-op.
pub const NULL_HANDLE: Handle = 0;

/// Host page size used for every device and system allocation.
pub const PAGE_SIZE: u64 = 0x1000;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Check whether `value` is a multiple of `align` (power of two).
#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Where a physical allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local video memory.
    Local,
    /// Host memory reached over the bus, cache-coherent ("GART").
    System,
}

impl MemoryLocation {
    pub fn is_system(self) -> bool {
        self == Self::System
    }
}
