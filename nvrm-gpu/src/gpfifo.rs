// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPFIFO ring entries and producer bookkeeping.

use std::sync::atomic::{fence, Ordering};

use log::trace;

use nvrm_client::CpuMapping;
use nvrm_common::classes::userd;
use nvrm_common::GpuVa;

use crate::error::{GpuError, GpuResult};

/// Bytes per ring entry.
pub const GP_ENTRY_SIZE: u64 = 8;

/// Longest segment one entry can describe, in words.
pub const MAX_ENTRY_WORDS: u32 = 0x1F_FFFF;

/// One ring entry: a reference to a command segment in GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpfifoEntry {
    pub address: GpuVa,
    pub words: u32,
    /// Wait for the previous segment to finish fetching before this one.
    pub no_prefetch: bool,
}

impl GpfifoEntry {
    pub fn validate(&self) -> GpuResult<()> {
        if self.address & 3 != 0 || self.address >> 40 != 0 {
            return Err(GpuError::InvalidArgument("GPFIFO entry address"));
        }
        if self.words == 0 || self.words > MAX_ENTRY_WORDS {
            return Err(GpuError::InvalidArgument("GPFIFO entry length"));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u32; 2] {
        let entry0 = self.address as u32 & !3;
        let entry1 = ((self.address >> 32) as u32 & 0xFF)
            | ((self.words & MAX_ENTRY_WORDS) << 10)
            | ((self.no_prefetch as u32) << 31);
        [entry0, entry1]
    }
}

/// Producer side of a GPFIFO ring.
///
/// The consumer offset is never read back from the GPU. Entries count as
/// outstanding from [`GpfifoRing::push`] until the submission that published
/// them is known complete ([`GpfifoRing::retire`]).
#[derive(Debug)]
pub struct GpfifoRing {
    capacity: u32,
    put: u32,
    unpublished: u32,
    in_flight: u32,
}

impl GpfifoRing {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            put: 0,
            unpublished: 0,
            in_flight: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Producer offset, in entries.
    pub fn put(&self) -> u32 {
        self.put
    }

    /// Entries pushed but not yet published.
    pub fn pending(&self) -> u32 {
        self.unpublished
    }

    /// Entries that can still be pushed. One slot stays empty so a full ring
    /// is distinguishable from an empty one.
    pub fn space(&self) -> u32 {
        self.capacity - 1 - self.unpublished - self.in_flight
    }

    /// Write `entry` at the producer offset of `ring` and advance it.
    pub fn push(&mut self, ring: &CpuMapping, entry: &GpfifoEntry) -> GpuResult<u32> {
        entry.validate()?;
        if self.space() == 0 {
            return Err(GpuError::RingFull {
                capacity: self.capacity,
            });
        }
        let slot = self.put;
        ring.write_words((slot as u64 * GP_ENTRY_SIZE) as usize, &entry.encode());
        self.put = (self.put + 1) % self.capacity;
        self.unpublished += 1;
        trace!(
            "gpfifo: entry {slot} -> 0x{:X} len={}",
            entry.address,
            entry.words
        );
        Ok(slot)
    }

    /// Withdraw the most recent unpublished entry.
    pub fn unpush(&mut self) {
        if self.unpublished == 0 {
            return;
        }
        self.put = (self.put + self.capacity - 1) % self.capacity;
        self.unpublished -= 1;
    }

    /// Make everything pushed so far visible to the GPU by storing GP_PUT in
    /// the channel's USERD page.
    pub fn publish(&mut self, userd: &CpuMapping, userd_offset: usize) {
        fence(Ordering::Release);
        userd
            .atomic_u32(userd_offset + userd::GP_PUT)
            .store(self.put, Ordering::Release);
        self.in_flight += self.unpublished;
        self.unpublished = 0;
        trace!("gpfifo: GP_PUT={}", self.put);
    }

    /// All published entries have been consumed.
    pub fn retire(&mut self) {
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_memory(entries: u32) -> CpuMapping {
        CpuMapping::anonymous((entries as u64 * GP_ENTRY_SIZE) as usize, 0).unwrap()
    }

    #[test]
    fn test_entry_encoding() {
        let e = GpfifoEntry {
            address: 0xAB_1234_5678,
            words: 10,
            no_prefetch: true,
        };
        let [lo, hi] = e.encode();
        assert_eq!(lo, 0x1234_5678);
        assert_eq!(hi & 0xFF, 0xAB);
        assert_eq!((hi >> 10) & MAX_ENTRY_WORDS, 10);
        assert_eq!(hi >> 31, 1);
    }

    #[test]
    fn test_entry_validation() {
        let mut e = GpfifoEntry {
            address: 0x1002,
            words: 1,
            no_prefetch: false,
        };
        assert!(e.validate().is_err());
        e.address = 0x1000;
        e.words = 0;
        assert!(e.validate().is_err());
        e.words = MAX_ENTRY_WORDS;
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_put_wraps_modulo_capacity() {
        let capacity = 8;
        let mem = ring_memory(capacity);
        let userd = CpuMapping::anonymous(0x200, 0).unwrap();
        let mut ring = GpfifoRing::new(capacity);
        let entry = GpfifoEntry {
            address: 0x1000,
            words: 4,
            no_prefetch: false,
        };
        for n in 1..=20u32 {
            ring.push(&mem, &entry).unwrap();
            assert_eq!(ring.put(), n % capacity);
            ring.publish(&userd, 0);
            assert_eq!(userd.read_u32(userd::GP_PUT), n % capacity);
            ring.retire();
        }
    }

    #[test]
    fn test_ring_full() {
        let mem = ring_memory(4);
        let mut ring = GpfifoRing::new(4);
        let entry = GpfifoEntry {
            address: 0x1000,
            words: 1,
            no_prefetch: false,
        };
        for _ in 0..3 {
            ring.push(&mem, &entry).unwrap();
        }
        assert!(matches!(
            ring.push(&mem, &entry),
            Err(GpuError::RingFull { capacity: 4 })
        ));

        // Published but unretired entries still occupy the ring.
        let userd = CpuMapping::anonymous(0x200, 0).unwrap();
        ring.publish(&userd, 0);
        assert_eq!(ring.space(), 0);
        ring.retire();
        assert_eq!(ring.space(), 3);
    }

    #[test]
    fn test_unpush_only_withdraws_unpublished() {
        let mem = ring_memory(4);
        let userd = CpuMapping::anonymous(0x200, 0).unwrap();
        let mut ring = GpfifoRing::new(4);
        let entry = GpfifoEntry {
            address: 0x1000,
            words: 1,
            no_prefetch: false,
        };
        ring.push(&mem, &entry).unwrap();
        ring.publish(&userd, 0);
        ring.unpush();
        assert_eq!(ring.put(), 1);

        ring.push(&mem, &entry).unwrap();
        ring.unpush();
        assert_eq!((ring.put(), ring.pending()), (1, 0));
        assert_eq!(ring.space(), 2);
    }

    #[test]
    fn test_entries_written_in_place() {
        let mem = ring_memory(4);
        let mut ring = GpfifoRing::new(4);
        let entry = GpfifoEntry {
            address: 0x2000,
            words: 3,
            no_prefetch: false,
        };
        ring.push(&mem, &entry).unwrap();
        let slot = ring.push(&mem, &entry).unwrap();
        assert_eq!(slot, 1);
        let mut words = [0u32; 2];
        mem.read_words(8, &mut words);
        assert_eq!(words, entry.encode());
    }
}
