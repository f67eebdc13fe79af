// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-local CPU view of resource manager memory.
//!
//! The memory behind a mapping is shared with the GPU (or with the software
//! resource manager standing in for it), so every access goes through
//! volatile or atomic operations and takes `&self`.

use std::any::Any;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::MmapMut;

/// A CPU mapping of device-visible memory.
///
/// The mapped pages stay valid for as long as the mapping is alive; dropping
/// it releases the process-local view only. The resource manager side is
/// torn down separately with the matching unmap call, using the exact
/// `linear_address` and length recorded here.
pub struct CpuMapping {
    ptr: NonNull<u8>,
    len: usize,
    linear_address: u64,
    _owner: Box<dyn Any + Send + Sync>,
}

// SAFETY: the pointer is only dereferenced through volatile/atomic accesses,
// and the owner keeping the pages alive is itself Send + Sync.
unsafe impl Send for CpuMapping {}
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    /// Wrap an existing memory map.
    pub fn from_mmap(mut map: MmapMut, linear_address: u64) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            linear_address,
            _owner: Box::new(map),
        }
    }

    /// Fresh zero-filled anonymous pages.
    pub fn anonymous(len: usize, linear_address: u64) -> io::Result<Self> {
        let map = MmapMut::map_anon(len.max(1))?;
        let mut mapping = Self::from_mmap(map, linear_address);
        mapping.len = len;
        Ok(mapping)
    }

    /// Build a mapping over memory owned by `owner`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned to 8
    /// bytes, for as long as `owner` is alive.
    pub unsafe fn from_raw_parts(
        ptr: NonNull<u8>,
        len: usize,
        linear_address: u64,
        owner: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            len,
            linear_address,
            _owner: owner,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address the resource manager handed out for this mapping.
    pub fn linear_address(&self) -> u64 {
        self.linear_address
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn at(&self, offset: usize, size: usize) -> *mut u8 {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.len),
            "mapping access out of bounds: offset=0x{offset:X} size={size} len=0x{:X}",
            self.len
        );
        assert!(offset % size == 0, "misaligned mapping access at 0x{offset:X}");
        // SAFETY: bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: in bounds and aligned.
        unsafe { (self.at(offset, 4) as *const u32).read_volatile() }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        // SAFETY: in bounds and aligned.
        unsafe { (self.at(offset, 4) as *mut u32).write_volatile(value) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        // SAFETY: in bounds and aligned.
        unsafe { (self.at(offset, 8) as *const u64).read_volatile() }
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        // SAFETY: in bounds and aligned.
        unsafe { (self.at(offset, 8) as *mut u64).write_volatile(value) }
    }

    /// View a 32-bit word as an atomic shared with the other side.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: in bounds, aligned, and only ever accessed atomically or
        // volatilely while the mapping lives.
        unsafe { &*(self.at(offset, 4) as *const AtomicU32) }
    }

    /// View a 64-bit word as an atomic shared with the other side.
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: see `atomic_u32`.
        unsafe { &*(self.at(offset, 8) as *const AtomicU64) }
    }

    /// Store consecutive 32-bit words starting at `offset`.
    pub fn write_words(&self, offset: usize, words: &[u32]) {
        for (i, &w) in words.iter().enumerate() {
            self.write_u32(offset + i * 4, w);
        }
    }

    pub fn read_words(&self, offset: usize, out: &mut [u32]) {
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.read_u32(offset + i * 4);
        }
    }
}

impl std::fmt::Debug for CpuMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuMapping")
            .field("ptr", &self.ptr)
            .field("len", &format_args!("0x{:X}", self.len))
            .field("linear_address", &format_args!("0x{:X}", self.linear_address))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anonymous_mapping_is_zeroed() {
        let m = CpuMapping::anonymous(0x1000, 0x1234_0000).unwrap();
        assert_eq!(m.len(), 0x1000);
        assert_eq!(m.linear_address(), 0x1234_0000);
        assert_eq!(m.read_u64(0xFF8), 0);
    }

    #[test]
    fn test_word_access() {
        let m = CpuMapping::anonymous(0x1000, 0).unwrap();
        m.write_u32(0x8C, 7);
        assert_eq!(m.read_u32(0x8C), 7);
        m.write_u64(0x10, 0x1_0000_0002);
        assert_eq!(m.read_u32(0x10), 2);
        assert_eq!(m.read_u32(0x14), 1);
        m.write_words(0x100, &[1, 2, 3]);
        let mut out = [0u32; 3];
        m.read_words(0x100, &mut out);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_atomic_views_alias_volatile_words() {
        let m = CpuMapping::anonymous(0x1000, 0).unwrap();
        m.atomic_u64(0x40).store(0xDEAD_BEEF_0000_0001, Ordering::Release);
        assert_eq!(m.read_u64(0x40), 0xDEAD_BEEF_0000_0001);
        m.write_u32(0x48, 9);
        assert_eq!(m.atomic_u32(0x48).load(Ordering::Acquire), 9);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let m = CpuMapping::anonymous(0x1000, 0).unwrap();
        m.read_u32(0x1000);
    }
}
