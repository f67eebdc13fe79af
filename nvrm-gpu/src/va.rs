// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client-managed GPU virtual address heap.
//!
//! Every virtual allocation is placed by the client and passed to the
//! resource manager as a fixed address. The heap is a first-fit free list
//! keyed by start address; freed blocks coalesce with their neighbours.
//! Addresses outside the managed window are left to the caller and are not
//! tracked.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::trace;

use nvrm_common::{align_up, is_aligned, GpuVa, PAGE_SIZE};

use crate::device::Device;
use crate::error::{GpuError, GpuResult};

/// First-fit allocator over `[start, end)`.
#[derive(Debug)]
pub struct VaHeap {
    start: GpuVa,
    end: GpuVa,
    /// Free blocks: start -> size.
    free: BTreeMap<GpuVa, u64>,
}

impl VaHeap {
    pub fn new(start: GpuVa, end: GpuVa) -> Self {
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        Self { start, end, free }
    }

    /// Whether `[addr, addr + size)` lies inside the managed window.
    pub fn manages(&self, addr: GpuVa, size: u64) -> bool {
        addr >= self.start && addr.checked_add(size).is_some_and(|end| end <= self.end)
    }

    fn outside(&self, addr: GpuVa, size: u64) -> bool {
        addr.saturating_add(size) <= self.start || addr >= self.end
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    pub fn alloc(&mut self, size: u64, align: u64) -> GpuResult<GpuVa> {
        if size == 0 || !align.is_power_of_two() {
            return Err(GpuError::InvalidArgument("VA size or alignment"));
        }
        let size = align_up(size, PAGE_SIZE);
        let found = self.free.iter().find_map(|(&block, &len)| {
            let addr = align_up(block, align);
            (addr.checked_add(size)? <= block + len).then_some((block, addr))
        });
        let Some((block, addr)) = found else {
            return Err(GpuError::OutOfVa { size });
        };
        self.carve(block, addr, size);
        trace!("va: alloc 0x{addr:X} size=0x{size:X}");
        Ok(addr)
    }

    /// Reserve exactly `[addr, addr + size)`. Returns `false` if the range is
    /// entirely outside the managed window (nothing is tracked then).
    pub fn reserve(&mut self, addr: GpuVa, size: u64) -> GpuResult<bool> {
        if size == 0 || !is_aligned(addr, PAGE_SIZE) {
            return Err(GpuError::InvalidArgument("fixed VA address or size"));
        }
        let size = align_up(size, PAGE_SIZE);
        if self.outside(addr, size) {
            return Ok(false);
        }
        let block = self
            .free
            .range(..=addr)
            .next_back()
            .filter(|(&block, &len)| addr + size <= block + len)
            .map(|(&block, _)| block);
        let Some(block) = block else {
            return Err(GpuError::VaOverlap { addr, size });
        };
        self.carve(block, addr, size);
        trace!("va: reserve 0x{addr:X} size=0x{size:X}");
        Ok(true)
    }

    /// Take `[addr, addr + size)` out of the free block starting at `block`.
    fn carve(&mut self, block: GpuVa, addr: GpuVa, size: u64) {
        let Some(len) = self.free.remove(&block) else {
            return;
        };
        if addr > block {
            self.free.insert(block, addr - block);
        }
        let tail = addr + size;
        if tail < block + len {
            self.free.insert(tail, block + len - tail);
        }
    }

    /// Return a range to the heap.
    pub fn release(&mut self, addr: GpuVa, size: u64) {
        let mut start = addr;
        let mut size = align_up(size, PAGE_SIZE);

        if let Some((&prev, &prev_len)) = self.free.range(..addr).next_back() {
            if prev + prev_len == addr {
                self.free.remove(&prev);
                start = prev;
                size += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + size)) {
            size += next_len;
        }
        self.free.insert(start, size);
        trace!("va: release 0x{addr:X}");
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Number of free blocks.
    pub fn fragments(&self) -> usize {
        self.free.len()
    }
}

/// A range taken from the device heap, given back on drop.
pub struct VaReservation {
    device: Arc<Device>,
    addr: GpuVa,
    size: u64,
    tracked: bool,
}

impl VaReservation {
    pub fn alloc(device: &Arc<Device>, size: u64, align: u64) -> GpuResult<Self> {
        let addr = device.va_heap().lock().alloc(size, align)?;
        Ok(Self {
            device: device.clone(),
            addr,
            size: align_up(size, PAGE_SIZE),
            tracked: true,
        })
    }

    pub fn fixed(device: &Arc<Device>, addr: GpuVa, size: u64) -> GpuResult<Self> {
        let tracked = device.va_heap().lock().reserve(addr, size)?;
        Ok(Self {
            device: device.clone(),
            addr,
            size: align_up(size, PAGE_SIZE),
            tracked,
        })
    }

    pub fn addr(&self) -> GpuVa {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for VaReservation {
    fn drop(&mut self) {
        if self.tracked {
            self.device.va_heap().lock().release(self.addr, self.size);
        }
    }
}

impl std::fmt::Debug for VaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VaReservation(0x{:X}+0x{:X})", self.addr, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = 0x1_0000_0000;
    const END: u64 = 0x1_0010_0000;

    #[test]
    fn test_first_fit_with_alignment() {
        let mut heap = VaHeap::new(START, END);
        let a = heap.alloc(0x1000, 0x1000).unwrap();
        assert_eq!(a, START);
        let b = heap.alloc(0x1000, 0x10000).unwrap();
        assert_eq!(b, START + 0x10000);
        // The gap left by alignment is reused.
        let c = heap.alloc(0x2000, 0x1000).unwrap();
        assert_eq!(c, START + 0x1000);
    }

    #[test]
    fn test_release_coalesces() {
        let mut heap = VaHeap::new(START, END);
        let total = heap.free_bytes();
        let a = heap.alloc(0x3000, 0x1000).unwrap();
        let b = heap.alloc(0x1000, 0x1000).unwrap();
        let c = heap.alloc(0x5000, 0x1000).unwrap();
        heap.release(b, 0x1000);
        heap.release(a, 0x3000);
        heap.release(c, 0x5000);
        assert_eq!(heap.free_bytes(), total);
        assert_eq!(heap.fragments(), 1);
    }

    #[test]
    fn test_out_of_va() {
        let mut heap = VaHeap::new(START, START + 0x2000);
        heap.alloc(0x2000, 0x1000).unwrap();
        assert!(matches!(
            heap.alloc(0x1000, 0x1000),
            Err(GpuError::OutOfVa { size: 0x1000 })
        ));
    }

    #[test]
    fn test_fixed_reservation() {
        let mut heap = VaHeap::new(START, END);
        assert!(heap.reserve(START + 0x4000, 0x2000).unwrap());
        assert!(matches!(
            heap.reserve(START + 0x5000, 0x1000),
            Err(GpuError::VaOverlap { .. })
        ));
        // Allocation skips the reserved hole.
        assert_eq!(heap.alloc(0x5000, 0x1000).unwrap(), START + 0x6000);
        assert_eq!(heap.alloc(0x4000, 0x1000).unwrap(), START);
    }

    #[test]
    fn test_reservation_outside_window_is_untracked() {
        let mut heap = VaHeap::new(START, END);
        let before = heap.free_bytes();
        assert!(!heap.reserve(0x1000, 0x1000).unwrap());
        assert_eq!(heap.free_bytes(), before);
        // Straddling the window start is an overlap.
        assert!(heap.reserve(START - 0x1000, 0x2000).is_err());
    }

    #[test]
    fn test_invalid_arguments() {
        let mut heap = VaHeap::new(START, END);
        assert!(heap.alloc(0, 0x1000).is_err());
        assert!(heap.alloc(0x1000, 0x3000).is_err());
        assert!(heap.reserve(START + 1, 0x1000).is_err());
    }
}
