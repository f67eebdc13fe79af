// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Physical memory objects, GPU virtual ranges and the binding between them.

use std::sync::Arc;

use log::{trace, warn};

use nvrm_client::params::{dma_flags, memory_attr, memory_flags, memory_type, MemoryAllocParams};
use nvrm_client::{CpuMapping, RmMapping, RmObject};
use nvrm_common::classes::class;
use nvrm_common::{align_up, is_aligned, GpuVa, Handle, MemoryLocation, PAGE_SIZE};

use crate::device::Device;
use crate::error::{GpuError, GpuResult};
use crate::va::VaReservation;

/// MMU page kind: how the GPU interprets locality and compression of the
/// pages behind a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKind(pub u8);

impl PageKind {
    pub const PITCH: Self = Self(0x00);
    pub const Z16: Self = Self(0x01);
    pub const S8: Self = Self(0x02);
    pub const S8Z24: Self = Self(0x03);
    pub const ZF32_X24S8: Self = Self(0x04);
    pub const Z24S8: Self = Self(0x05);
    pub const GENERIC_MEMORY: Self = Self(0x06);

    /// Extra allocation attributes this kind requires, if any.
    pub fn attrs(self) -> Option<KindAttrs> {
        use memory_attr::*;
        let depth = |depth, packing, float| KindAttrs::Depth {
            depth,
            packing,
            float,
        };
        match self {
            Self::GENERIC_MEMORY => Some(KindAttrs::BlockLinear),
            Self::Z16 => Some(depth(DEPTH_16, ZS_PACKING_Z16, false)),
            Self::S8Z24 => Some(depth(DEPTH_32, ZS_PACKING_S8Z24, false)),
            Self::Z24S8 => Some(depth(DEPTH_32, ZS_PACKING_Z24S8, false)),
            Self::ZF32_X24S8 => Some(depth(DEPTH_32, ZS_PACKING_Z32_X24S8, true)),
            Self::S8 => Some(depth(DEPTH_UNKNOWN, ZS_PACKING_Z24S8, false)),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        self.0 as u32
    }
}

/// Allocation attributes implied by a page kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindAttrs {
    /// Colour or generic data in block-linear layout.
    BlockLinear,
    /// Depth/stencil surface with the given depth, packing and Z type.
    Depth { depth: u32, packing: u32, float: bool },
}

impl KindAttrs {
    pub fn apply(self, params: &mut MemoryAllocParams) {
        use memory_attr::*;
        match self {
            Self::BlockLinear => params.attr |= FORMAT_BLOCK_LINEAR,
            Self::Depth {
                depth,
                packing,
                float,
            } => {
                params.type_ = memory_type::DEPTH;
                params.attr &= !((DEPTH_MASK << DEPTH_SHIFT) | (ZS_PACKING_MASK << ZS_PACKING_SHIFT));
                params.attr |= (depth << DEPTH_SHIFT)
                    | (packing << ZS_PACKING_SHIFT)
                    | if float { Z_TYPE_FLOAT } else { Z_TYPE_FIXED }
                    | FORMAT_BLOCK_LINEAR;
            }
        }
    }
}

/// Surface layout requested for a tiled allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileMode {
    #[default]
    Pitch,
    BlockLinear,
}

/// A physical allocation in system or device-local memory.
pub struct PhysicalMemory {
    persistent: Option<RmMapping>,
    object: RmObject,
    device: Arc<Device>,
    size: u64,
    location: MemoryLocation,
    kind: PageKind,
}

impl PhysicalMemory {
    pub fn alloc(device: &Arc<Device>, size: u64, location: MemoryLocation) -> GpuResult<Self> {
        Self::alloc_tiled(device, size, location, PageKind::PITCH, TileMode::Pitch)
    }

    /// Allocate and keep a CPU mapping of the whole object for its lifetime.
    pub fn alloc_mapped(device: &Arc<Device>, size: u64, location: MemoryLocation) -> GpuResult<Self> {
        let mut memory = Self::alloc(device, size, location)?;
        let mapping = memory.map(0, memory.size)?;
        memory.persistent = Some(mapping);
        Ok(memory)
    }

    pub fn alloc_tiled(
        device: &Arc<Device>,
        size: u64,
        location: MemoryLocation,
        kind: PageKind,
        tile: TileMode,
    ) -> GpuResult<Self> {
        if size == 0 {
            return Err(GpuError::InvalidArgument("zero-sized allocation"));
        }
        let size = align_up(size, PAGE_SIZE);
        let (class_id, placement) = match location {
            MemoryLocation::System => (
                class::NV01_MEMORY_SYSTEM,
                memory_attr::LOCATION_PCI | memory_attr::COHERENCY_CACHED,
            ),
            MemoryLocation::Local => (
                class::NV01_MEMORY_LOCAL_USER,
                memory_attr::LOCATION_VIDMEM | memory_attr::COHERENCY_UNCACHED,
            ),
        };
        let mut params = MemoryAllocParams {
            owner: device.rm().handle(),
            type_: memory_type::IMAGE,
            flags: memory_flags::MAP_NOT_REQUIRED,
            attr: memory_attr::PAGE_SIZE_4KB | memory_attr::PHYSICALITY_CONTIGUOUS | placement,
            format: kind.raw(),
            size,
            alignment: PAGE_SIZE,
            ..Default::default()
        };
        if tile == TileMode::BlockLinear {
            params.attr |= memory_attr::FORMAT_BLOCK_LINEAR;
        }
        if let Some(attrs) = kind.attrs() {
            attrs.apply(&mut params);
        }
        let object = RmObject::alloc(device.rm(), device.handle(), class_id, &mut params)?;
        trace!(
            "memory: alloc 0x{:08X} {location:?} size=0x{size:X} kind=0x{:02X}",
            object.handle(),
            kind.0
        );
        Ok(Self {
            persistent: None,
            object,
            device: device.clone(),
            size,
            location,
            kind,
        })
    }

    /// Map `[offset, offset + length)` for CPU access. The mapping is undone
    /// with the same extent when the returned guard drops.
    pub fn map(&self, offset: u64, length: u64) -> GpuResult<RmMapping> {
        let in_range = offset.checked_add(length).is_some_and(|end| end <= self.size);
        if length == 0 || !in_range {
            return Err(GpuError::InvalidArgument("CPU map outside the allocation"));
        }
        Ok(RmMapping::new(
            self.device.rm(),
            self.device.subdevice_handle(),
            self.object.handle(),
            offset,
            length,
        )?)
    }

    /// The persistent mapping made by [`PhysicalMemory::alloc_mapped`].
    pub fn cpu(&self) -> Option<&CpuMapping> {
        self.persistent.as_deref()
    }

    pub fn handle(&self) -> Handle {
        self.object.handle()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn is_system(&self) -> bool {
        self.location.is_system()
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }
}

impl std::fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("object", &self.object)
            .field("size", &format_args!("0x{:X}", self.size))
            .field("location", &self.location)
            .finish()
    }
}

struct Binding {
    memory: Arc<PhysicalMemory>,
    gpu_va: GpuVa,
    range: u64,
}

/// A reserved GPU virtual range with at most one physical object bound.
pub struct VirtualRange {
    binding: Option<Binding>,
    object: Option<RmObject>,
    reservation: VaReservation,
    device: Arc<Device>,
    kind: PageKind,
}

impl VirtualRange {
    /// Reserve `size` bytes aligned to `align`, at `fixed` if given.
    ///
    /// Fails with [`GpuError::KindMismatch`] if the resource manager settles
    /// on a different page kind; the range is released in that case.
    pub fn alloc(
        device: &Arc<Device>,
        size: u64,
        align: u64,
        kind: PageKind,
        fixed: Option<GpuVa>,
    ) -> GpuResult<Self> {
        let align = align.max(device.settings().bind_align).max(PAGE_SIZE);
        let reservation = match fixed {
            Some(addr) => {
                if !is_aligned(addr, align) {
                    return Err(GpuError::InvalidArgument("fixed VA not aligned"));
                }
                VaReservation::fixed(device, addr, size)?
            }
            None => VaReservation::alloc(device, size, align)?,
        };

        let mut params = MemoryAllocParams {
            owner: device.rm().handle(),
            type_: memory_type::IMAGE,
            flags: memory_flags::VIRTUAL | memory_flags::FIXED_ADDRESS_ALLOCATE | memory_flags::KIND_FIXED,
            attr: memory_attr::PAGE_SIZE_4KB,
            format: kind.raw(),
            h_va_space: device.va_space_handle(),
            size: reservation.size(),
            alignment: align,
            offset: reservation.addr(),
            ..Default::default()
        };
        if let Some(attrs) = kind.attrs() {
            attrs.apply(&mut params);
        }
        let object = RmObject::alloc(device.rm(), device.handle(), class::NV50_MEMORY_VIRTUAL, &mut params)?;
        if params.format != kind.raw() {
            warn!(
                "va: kind 0x{:02X} negotiated as 0x{:02X}, releasing 0x{:X}",
                kind.0,
                params.format,
                reservation.addr()
            );
            return Err(GpuError::KindMismatch {
                requested: kind.raw(),
                negotiated: params.format,
            });
        }
        trace!(
            "va: range 0x{:X}+0x{:X} kind=0x{:02X}",
            reservation.addr(),
            reservation.size(),
            kind.0
        );
        Ok(Self {
            binding: None,
            object: Some(object),
            reservation,
            device: device.clone(),
            kind,
        })
    }

    pub fn base(&self) -> GpuVa {
        self.reservation.addr()
    }

    pub fn size(&self) -> u64 {
        self.reservation.size()
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// The bound memory object, if any.
    pub fn bound_memory(&self) -> Option<&Arc<PhysicalMemory>> {
        self.binding.as_ref().map(|b| &b.memory)
    }

    fn handle(&self) -> Handle {
        self.object.as_ref().map_or(0, RmObject::handle)
    }

    /// Make `base + va_offset` an alias of `memory` at `mem_offset` for
    /// `range` bytes. Returns the GPU address of the mapping.
    pub fn bind(
        &mut self,
        va_offset: u64,
        memory: &Arc<PhysicalMemory>,
        mem_offset: u64,
        range: u64,
    ) -> GpuResult<GpuVa> {
        if self.binding.is_some() {
            return Err(GpuError::AlreadyBound);
        }
        let fits_va = va_offset.checked_add(range).is_some_and(|end| end <= self.size());
        let fits_mem = mem_offset.checked_add(range).is_some_and(|end| end <= memory.size());
        if range == 0 || !fits_va || !fits_mem {
            return Err(GpuError::InvalidArgument("bind range"));
        }
        if !is_aligned(va_offset, PAGE_SIZE) || !is_aligned(mem_offset, PAGE_SIZE) {
            return Err(GpuError::InvalidArgument("bind offsets must be page aligned"));
        }

        let snoop = if memory.is_system() {
            dma_flags::CACHE_SNOOP_ENABLE
        } else {
            dma_flags::CACHE_SNOOP_DISABLE
        };
        let gpu_va = self.device.rm().map_memory_dma(
            self.device.handle(),
            self.handle(),
            memory.handle(),
            mem_offset,
            range,
            dma_flags::DMA_OFFSET_FIXED | dma_flags::PAGE_SIZE_4KB | snoop,
            self.base() + va_offset,
        )?;
        trace!(
            "va: bound 0x{:08X} at 0x{gpu_va:X} len=0x{range:X}",
            memory.handle()
        );
        self.binding = Some(Binding {
            memory: memory.clone(),
            gpu_va,
            range,
        });
        Ok(gpu_va)
    }

    /// Undo the current binding, which must cover `[va_offset, va_offset +
    /// range)`. Unbinding an unbound range succeeds.
    pub fn unbind(&mut self, va_offset: u64, range: u64) -> GpuResult<()> {
        match &self.binding {
            None => Ok(()),
            Some(b) if b.gpu_va == self.base() + va_offset && b.range == range => self.unbind_all(),
            Some(_) => Err(GpuError::InvalidArgument("unbind does not match the binding")),
        }
    }

    /// Undo whatever is bound.
    pub fn unbind_all(&mut self) -> GpuResult<()> {
        let Some(b) = self.binding.take() else {
            return Ok(());
        };
        self.device.rm().unmap_memory_dma(
            self.device.handle(),
            self.handle(),
            b.memory.handle(),
            0,
            b.gpu_va,
        )?;
        trace!("va: unbound 0x{:X}", b.gpu_va);
        Ok(())
    }

    /// Release the range and report the result. Callers unbind first; a
    /// range that is still bound is unbound with a warning.
    pub fn free(mut self) -> GpuResult<()> {
        self.unbind_still_bound();
        match self.object.take() {
            Some(object) => Ok(object.free()?),
            None => Ok(()),
        }
    }

    fn unbind_still_bound(&mut self) {
        if self.binding.is_none() {
            return;
        }
        warn!("va: freeing range 0x{:X} that is still bound", self.base());
        if let Err(e) = self.unbind_all() {
            warn!("va: unbind of 0x{:X} failed: {e}", self.base());
        }
    }
}

impl Drop for VirtualRange {
    fn drop(&mut self) {
        self.unbind_still_bound();
    }
}

impl std::fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VirtualRange(0x{:X}+0x{:X}, bound={})",
            self.base(),
            self.size(),
            self.is_bound()
        )
    }
}

/// Memory that is CPU mapped and bound at its own GPU address: the shape of
/// every ring, USERD page, notifier and command buffer.
pub struct GpuBuffer {
    cpu: RmMapping,
    va: VirtualRange,
    memory: Arc<PhysicalMemory>,
}

impl GpuBuffer {
    pub fn alloc(device: &Arc<Device>, size: u64, location: MemoryLocation) -> GpuResult<Self> {
        let memory = Arc::new(PhysicalMemory::alloc(device, size, location)?);
        let cpu = memory.map(0, memory.size())?;
        let mut va = VirtualRange::alloc(device, memory.size(), PAGE_SIZE, PageKind::PITCH, None)?;
        va.bind(0, &memory, 0, memory.size())?;
        Ok(Self { cpu, va, memory })
    }

    pub fn gpu_va(&self) -> GpuVa {
        self.va.base()
    }

    pub fn size(&self) -> u64 {
        self.memory.size()
    }

    pub fn cpu(&self) -> &CpuMapping {
        &self.cpu
    }

    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.va.unbind_all() {
            warn!("memory: unbind of buffer 0x{:X} failed: {e}", self.va.base());
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("gpu_va", &format_args!("0x{:X}", self.gpu_va()))
            .field("memory", &self.memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::open_sim;
    use nvrm_client::Escape;
    use nvrm_sim::SimConfig;

    #[test]
    fn test_alloc_then_free_va_does_not_leak() {
        let (sim, device) = open_sim(SimConfig::default());
        let before = sim.stats();
        let free_before = device.va_heap().lock().free_bytes();

        let va = VirtualRange::alloc(&device, 0x10000, 0, PageKind::PITCH, None).unwrap();
        assert_eq!(sim.stats().live_objects, before.live_objects + 1);
        va.free().unwrap();

        let after = sim.stats();
        assert_eq!(after.live_objects, before.live_objects);
        assert_eq!(
            after.calls(Escape::RmAlloc) - before.calls(Escape::RmAlloc),
            after.calls(Escape::RmFree) - before.calls(Escape::RmFree)
        );
        assert_eq!(device.va_heap().lock().free_bytes(), free_before);
        assert_eq!(after.teardown_violations, 0);
    }

    #[test]
    fn test_fixed_address_and_overlap() {
        let (_sim, device) = open_sim(SimConfig::default());
        let base = device.settings().va_start + 0x100_0000;
        let va = VirtualRange::alloc(&device, 0x4000, 0, PageKind::PITCH, Some(base)).unwrap();
        assert_eq!(va.base(), base);
        let err = VirtualRange::alloc(&device, 0x1000, 0, PageKind::PITCH, Some(base + 0x1000)).unwrap_err();
        assert!(matches!(err, GpuError::VaOverlap { .. }));
    }

    #[test]
    fn test_kind_mismatch_tears_down() {
        let (sim, device) = open_sim(SimConfig::default());
        let before = sim.stats().live_objects;
        let free_before = device.va_heap().lock().free_bytes();

        sim.override_kind(Some(PageKind::GENERIC_MEMORY.raw()));
        let err = VirtualRange::alloc(&device, 0x1000, 0, PageKind::Z24S8, None).unwrap_err();
        assert!(matches!(
            err,
            GpuError::KindMismatch {
                requested: 0x05,
                negotiated: 0x06
            }
        ));
        sim.override_kind(None);

        assert_eq!(sim.stats().live_objects, before);
        assert_eq!(device.va_heap().lock().free_bytes(), free_before);
    }

    #[test]
    fn test_depth_kind_attrs() {
        let mut params = MemoryAllocParams::default();
        PageKind::ZF32_X24S8.attrs().unwrap().apply(&mut params);
        assert_eq!(params.type_, memory_type::DEPTH);
        assert_ne!(params.attr & memory_attr::Z_TYPE_FLOAT, 0);
        assert_ne!(params.attr & memory_attr::FORMAT_BLOCK_LINEAR, 0);
        assert_eq!(
            (params.attr >> memory_attr::ZS_PACKING_SHIFT) & memory_attr::ZS_PACKING_MASK,
            memory_attr::ZS_PACKING_Z32_X24S8
        );
        assert_eq!(PageKind::PITCH.attrs(), None);
    }

    #[test]
    fn test_bind_is_visible_to_gpu() {
        let (sim, device) = open_sim(SimConfig::default());
        let memory = Arc::new(PhysicalMemory::alloc_mapped(&device, 0x2000, MemoryLocation::System).unwrap());
        memory.cpu().unwrap().write_u32(0x1004, 0xCAFE_F00D);

        let mut va = VirtualRange::alloc(&device, 0x4000, 0, PageKind::PITCH, None).unwrap();
        let gpu_va = va.bind(0x2000, &memory, 0x1000, 0x1000).unwrap();
        assert_eq!(gpu_va, va.base() + 0x2000);
        assert_eq!(sim.read_gpu_words(gpu_va + 4, 1), Some(vec![0xCAFE_F00D]));

        va.unbind(0x2000, 0x1000).unwrap();
        assert_eq!(sim.read_gpu_words(gpu_va, 1), None);
        assert_eq!(sim.stats().live_gpu_mappings, 0);
    }

    #[test]
    fn test_rebind_without_unbind_is_an_error() {
        let (_sim, device) = open_sim(SimConfig::default());
        let a = Arc::new(PhysicalMemory::alloc(&device, 0x1000, MemoryLocation::Local).unwrap());
        let b = Arc::new(PhysicalMemory::alloc(&device, 0x1000, MemoryLocation::Local).unwrap());
        let mut va = VirtualRange::alloc(&device, 0x1000, 0, PageKind::PITCH, None).unwrap();
        va.bind(0, &a, 0, 0x1000).unwrap();
        assert!(matches!(va.bind(0, &b, 0, 0x1000), Err(GpuError::AlreadyBound)));
        assert!(Arc::ptr_eq(va.bound_memory().unwrap(), &a));

        va.unbind(0, 0x1000).unwrap();
        va.bind(0, &b, 0, 0x1000).unwrap();
        assert!(Arc::ptr_eq(va.bound_memory().unwrap(), &b));
    }

    #[test]
    fn test_bind_bounds_checked() {
        let (_sim, device) = open_sim(SimConfig::default());
        let memory = Arc::new(PhysicalMemory::alloc(&device, 0x1000, MemoryLocation::System).unwrap());
        let mut va = VirtualRange::alloc(&device, 0x2000, 0, PageKind::PITCH, None).unwrap();
        assert!(va.bind(0, &memory, 0, 0x2000).is_err());
        assert!(va.bind(0x2000, &memory, 0, 0x1000).is_err());
        assert!(!va.is_bound());
    }

    #[test]
    fn test_free_while_bound_unbinds_first() {
        let (sim, device) = open_sim(SimConfig::default());
        let memory = Arc::new(PhysicalMemory::alloc(&device, 0x1000, MemoryLocation::System).unwrap());
        let mut va = VirtualRange::alloc(&device, 0x1000, 0, PageKind::PITCH, None).unwrap();
        va.bind(0, &memory, 0, 0x1000).unwrap();
        va.free().unwrap();
        drop(memory);

        let stats = sim.stats();
        assert_eq!(stats.live_gpu_mappings, 0);
        assert_eq!(stats.teardown_violations, 0);
    }

    #[test]
    fn test_cpu_map_exact_extent() {
        let (sim, device) = open_sim(SimConfig::default());
        let memory = PhysicalMemory::alloc(&device, 0x3000, MemoryLocation::System).unwrap();
        assert!(memory.map(0x2000, 0x2000).is_err());
        {
            let a = memory.map(0x1000, 0x1000).unwrap();
            let b = memory.map(0, 0x3000).unwrap();
            a.write_u32(0, 7);
            assert_eq!(b.read_u32(0x1000), 7);
        }
        assert_eq!(sim.stats().live_cpu_mappings, 1);
    }

    #[test]
    fn test_gpu_buffer_teardown_is_clean() {
        let (sim, device) = open_sim(SimConfig::default());
        let before = sim.stats();
        let buffer = GpuBuffer::alloc(&device, 0x1800, MemoryLocation::System).unwrap();
        assert_eq!(buffer.size(), 0x2000);
        buffer.cpu().write_u32(0x1FFC, 0x1234);
        assert_eq!(sim.read_gpu_words(buffer.gpu_va() + 0x1FFC, 1), Some(vec![0x1234]));
        drop(buffer);

        let after = sim.stats();
        assert_eq!(after.live_objects, before.live_objects);
        assert_eq!(after.live_cpu_mappings, before.live_cpu_mappings);
        assert_eq!(after.live_gpu_mappings, 0);
        assert_eq!(after.teardown_violations, 0);
    }
}
