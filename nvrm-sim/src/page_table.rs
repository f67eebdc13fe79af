// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address translation for the software GPU.
//!
//! Maps 40-bit GPU virtual pages to pages of physical allocations using a
//! 2-level page table with 4 KB pages.
//!
//! Layout: `[L0: 14 bits][L1: 14 bits][Offset: 12 bits]` = 40 bits total.

use std::sync::Arc;

use nvrm_client::CpuMapping;

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const L1_BITS: u32 = 14;
const L0_BITS: u32 = 14;
const L1_SIZE: usize = 1 << L1_BITS;

/// Total GPU address space: 40 bits = 1 TiB.
pub const GPU_VA_BITS: u32 = L0_BITS + L1_BITS + PAGE_BITS;
pub const GPU_VA_SIZE: u64 = 1 << GPU_VA_BITS;

/// Physical page backing one GPU virtual page.
#[derive(Clone)]
struct PageEntry {
    backing: Arc<CpuMapping>,
    /// Byte offset of the page inside `backing`.
    offset: usize,
}

type L1Table = Box<[Option<PageEntry>]>;

/// GPU page table.
pub struct GpuPageTable {
    page_table: Vec<Option<L1Table>>,
    mapped_pages: usize,
}

impl GpuPageTable {
    pub fn new() -> Self {
        let l0_size = 1 << L0_BITS;
        let mut page_table = Vec::with_capacity(l0_size);
        page_table.resize_with(l0_size, || None);
        Self {
            page_table,
            mapped_pages: 0,
        }
    }

    /// Map `size` bytes at `gpu_va` onto `backing` starting at `offset`.
    /// Both `gpu_va` and `offset` must be page aligned.
    pub fn map(&mut self, gpu_va: u64, backing: &Arc<CpuMapping>, offset: usize, size: u64) {
        let mut done = 0u64;
        while done < size {
            self.set_entry(
                gpu_va + done,
                Some(PageEntry {
                    backing: backing.clone(),
                    offset: offset + done as usize,
                }),
            );
            done += PAGE_SIZE;
        }
        log::trace!(
            "sim-mmu: map GPU 0x{:X}..0x{:X} -> backing+0x{:X}",
            gpu_va,
            gpu_va + size,
            offset
        );
    }

    /// Unmap a contiguous GPU VA range.
    pub fn unmap(&mut self, gpu_va: u64, size: u64) {
        let mut done = 0u64;
        while done < size {
            self.set_entry(gpu_va + done, None);
            done += PAGE_SIZE;
        }
        log::trace!("sim-mmu: unmap GPU 0x{:X}..0x{:X}", gpu_va, gpu_va + size);
    }

    pub fn is_mapped(&self, gpu_va: u64) -> bool {
        self.get_entry(gpu_va).is_some()
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages
    }

    /// Read from GPU VA space. Returns `false` if any byte was unmapped
    /// (those bytes read as zero).
    pub fn read(&self, gpu_va: u64, dst: &mut [u8]) -> bool {
        let mut ok = true;
        let mut offset = 0usize;
        while offset < dst.len() {
            let va = gpu_va + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk = std::cmp::min(dst.len() - offset, PAGE_SIZE as usize - page_off);
            match self.get_entry(va) {
                Some(e) => {
                    for (i, b) in dst[offset..offset + chunk].iter_mut().enumerate() {
                        *b = read_byte(&e.backing, e.offset + page_off + i);
                    }
                }
                None => {
                    dst[offset..offset + chunk].fill(0);
                    ok = false;
                }
            }
            offset += chunk;
        }
        ok
    }

    /// Read consecutive little-endian 32-bit words.
    pub fn read_words(&self, gpu_va: u64, count: usize) -> Option<Vec<u32>> {
        let mut buf = vec![0u8; count * 4];
        if !self.read(gpu_va, &mut buf) {
            return None;
        }
        Some(
            buf.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Resolve an aligned word address to its backing and offset, for atomic
    /// semaphore accesses.
    pub fn resolve(&self, gpu_va: u64) -> Option<(Arc<CpuMapping>, usize)> {
        let page_off = (gpu_va & (PAGE_SIZE - 1)) as usize;
        self.get_entry(gpu_va)
            .map(|e| (e.backing.clone(), e.offset + page_off))
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn l0_index(gpu_va: u64) -> usize {
        ((gpu_va >> (L1_BITS + PAGE_BITS)) & ((1 << L0_BITS) - 1)) as usize
    }

    fn l1_index(gpu_va: u64) -> usize {
        ((gpu_va >> PAGE_BITS) & ((1 << L1_BITS) - 1)) as usize
    }

    fn set_entry(&mut self, gpu_va: u64, entry: Option<PageEntry>) {
        let l0 = Self::l0_index(gpu_va);
        let l1 = Self::l1_index(gpu_va);

        if self.page_table[l0].is_none() {
            if entry.is_none() {
                return; // No L1 table and we're unmapping; nothing to do.
            }
            self.page_table[l0] = Some(vec![None; L1_SIZE].into_boxed_slice());
        }
        let Some(table) = self.page_table[l0].as_mut() else {
            return;
        };
        match (table[l1].is_some(), entry.is_some()) {
            (false, true) => self.mapped_pages += 1,
            (true, false) => self.mapped_pages -= 1,
            _ => {}
        }
        table[l1] = entry;
    }

    fn get_entry(&self, gpu_va: u64) -> Option<&PageEntry> {
        if gpu_va >= GPU_VA_SIZE {
            return None;
        }
        let l0 = Self::l0_index(gpu_va);
        let l1 = Self::l1_index(gpu_va);
        self.page_table[l0].as_ref().and_then(|t| t[l1].as_ref())
    }
}

impl Default for GpuPageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn read_byte(backing: &CpuMapping, offset: usize) -> u8 {
    let word = backing.read_u32(offset & !3);
    (word >> ((offset & 3) * 8)) as u8
}
