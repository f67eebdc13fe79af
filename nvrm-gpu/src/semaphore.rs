// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Semaphore surfaces: GPU-written counters the CPU reads directly and the
//! resource manager watches on the CPU's behalf.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use nvrm_client::params::{
    ctrl, SemSurfChannelParams, SemSurfRegisterWaiterParams, SemSurfSetValueParams,
    SemSurfUnregisterWaiterParams, SemaphoreSurfaceAllocParams, SemaphoreSurfaceLayoutParams,
    SEMAPHORE_SURFACE_CAPS_64BIT_SUPPORTED,
};
use nvrm_client::{RmError, RmObject, RmResult};
use nvrm_common::classes::class;
use nvrm_common::semaphore::reconstruct_value;
use nvrm_common::{align_up, ArchTable, GpuVa, Handle, MemoryLocation, PAGE_SIZE};

use crate::device::Device;
use crate::error::{GpuError, GpuResult};
use crate::memory::GpuBuffer;

/// Slot geometry reported by the subdevice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreLayout {
    /// Bytes per slot.
    pub slot_size: u64,
    /// Offset of the 64-bit "max submitted" shadow inside a slot.
    pub max_submitted_offset: u64,
    /// Whether GPU releases write the full 64-bit value.
    pub supports_64bit: bool,
}

impl SemaphoreLayout {
    pub fn query(subdevice: &RmObject, arch: &ArchTable) -> RmResult<Self> {
        let mut params = SemaphoreSurfaceLayoutParams::default();
        subdevice.control(ctrl::FB_GET_SEMAPHORE_SURFACE_LAYOUT, &mut params)?;
        let slot_size = params.size as u64;
        let max_submitted_offset = params.max_submitted_semaphore_value_offset as u64;
        if slot_size == 0 || max_submitted_offset + 8 > slot_size {
            return Err(RmError::InvalidArgument("semaphore surface layout"));
        }
        Ok(Self {
            slot_size,
            max_submitted_offset,
            supports_64bit: params.caps & SEMAPHORE_SURFACE_CAPS_64BIT_SUPPORTED != 0
                && arch.supports_64bit_semaphores(),
        })
    }
}

/// A semaphore surface and the system memory backing it.
pub struct SemaphoreSurface {
    object: RmObject,
    memory: GpuBuffer,
    layout: SemaphoreLayout,
    slots: u64,
}

impl SemaphoreSurface {
    /// Allocate a surface of at least `size` bytes.
    pub fn create(device: &Arc<Device>, size: u64) -> GpuResult<Self> {
        let layout = device.semaphore_layout();
        let size = align_up(size.max(layout.slot_size), PAGE_SIZE);
        let memory = GpuBuffer::alloc(device, size, MemoryLocation::System)?;

        let h_memory = memory.memory().handle();
        let mut params = SemaphoreSurfaceAllocParams {
            h_semaphore_mem: h_memory,
            h_max_submitted_mem: h_memory,
            flags: 0,
        };
        let object = RmObject::alloc(
            device.rm(),
            device.subdevice_handle(),
            class::NV_SEMAPHORE_SURFACE,
            &mut params,
        )?;
        debug!(
            "semaphore: surface 0x{:08X} at 0x{:X}, {} slots",
            object.handle(),
            memory.gpu_va(),
            size / layout.slot_size
        );
        Ok(Self {
            object,
            memory,
            layout,
            slots: size / layout.slot_size,
        })
    }

    pub fn handle(&self) -> Handle {
        self.object.handle()
    }

    pub fn layout(&self) -> SemaphoreLayout {
        self.layout
    }

    pub fn slots(&self) -> u64 {
        self.slots
    }

    fn slot_offset(&self, index: u64) -> GpuResult<u64> {
        if index >= self.slots {
            return Err(GpuError::InvalidArgument("semaphore index out of range"));
        }
        Ok(index * self.layout.slot_size)
    }

    /// GPU address of slot `index`, the target of release and acquire
    /// methods.
    pub fn gpu_address(&self, index: u64) -> GpuResult<GpuVa> {
        Ok(self.memory.gpu_va() + self.slot_offset(index)?)
    }

    /// Route this surface's notifications for `h_channel` through `indices`.
    pub fn bind_channel(&self, h_channel: Handle, indices: &[u32]) -> GpuResult<()> {
        let mut params = SemSurfChannelParams::new(h_channel, indices)
            .ok_or(GpuError::InvalidArgument("too many notification indices"))?;
        self.object.control(ctrl::SEMSURF_BIND_CHANNEL, &mut params)?;
        trace!("semaphore: bound channel 0x{h_channel:08X} to 0x{:08X}", self.handle());
        Ok(())
    }

    pub fn unbind_channel(&self, h_channel: Handle, indices: &[u32]) -> GpuResult<()> {
        let mut params = SemSurfChannelParams::new(h_channel, indices)
            .ok_or(GpuError::InvalidArgument("too many notification indices"))?;
        self.object.control(ctrl::SEMSURF_UNBIND_CHANNEL, &mut params)?;
        trace!("semaphore: unbound channel 0x{h_channel:08X}");
        Ok(())
    }

    /// Ask the resource manager to signal `notification_handle` once slot
    /// `index` reaches `wait_value`, writing `new_value` to the slot first if
    /// it is nonzero. A waiter fires once and is then gone.
    pub fn register_waiter(
        &self,
        index: u64,
        wait_value: u64,
        new_value: u64,
        notification_handle: u64,
    ) -> GpuResult<()> {
        self.slot_offset(index)?;
        let mut params = SemSurfRegisterWaiterParams {
            index,
            wait_value,
            new_value,
            notification_handle,
        };
        self.object.control(ctrl::SEMSURF_REGISTER_WAITER, &mut params)?;
        Ok(())
    }

    pub fn unregister_waiter(&self, index: u64, wait_value: u64, notification_handle: u64) -> GpuResult<()> {
        let mut params = SemSurfUnregisterWaiterParams {
            index,
            wait_value,
            notification_handle,
        };
        self.object.control(ctrl::SEMSURF_UNREGISTER_WAITER, &mut params)?;
        Ok(())
    }

    /// Current value of slot `index`.
    pub fn get_value(&self, index: u64) -> GpuResult<u64> {
        let off = self.slot_offset(index)? as usize;
        let cpu = self.memory.cpu();
        if self.layout.supports_64bit {
            return Ok(cpu.atomic_u64(off).load(Ordering::Acquire));
        }
        // The low word must be sampled before the shadow.
        let low = cpu.atomic_u32(off).load(Ordering::Acquire);
        fence(Ordering::Acquire);
        let shadow = cpu
            .atomic_u64(off + self.layout.max_submitted_offset as usize)
            .load(Ordering::Acquire);
        Ok(reconstruct_value(low, shadow))
    }

    /// Set slot `index` through the resource manager, serialized with GPU
    /// writes. Also resets the slot's shadow to `value`.
    pub fn set_value(&self, index: u64, value: u64) -> GpuResult<()> {
        self.slot_offset(index)?;
        let mut params = SemSurfSetValueParams {
            index,
            new_value: value,
        };
        self.object.control(ctrl::SEMSURF_SET_VALUE, &mut params)?;
        Ok(())
    }

    /// Announce that GPU work releasing `value` into slot `index` is about to
    /// be submitted. The shadow only moves forward.
    pub fn set_max_submitted(&self, index: u64, value: u64) -> GpuResult<()> {
        let off = self.slot_offset(index)? + self.layout.max_submitted_offset;
        self.memory
            .cpu()
            .atomic_u64(off as usize)
            .fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    pub fn max_submitted(&self, index: u64) -> GpuResult<u64> {
        let off = self.slot_offset(index)? + self.layout.max_submitted_offset;
        Ok(self.memory.cpu().atomic_u64(off as usize).load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for SemaphoreSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreSurface")
            .field("object", &self.object)
            .field("gpu_va", &format_args!("0x{:X}", self.memory.gpu_va()))
            .field("slots", &self.slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::open_sim;
    use nvrm_client::params::SEMSURF_MAX_NOTIFY_INDICES;
    use nvrm_client::{Escape, OsEvent};
    use nvrm_common::status;
    use nvrm_sim::{SimConfig, MAX_SUBMITTED_OFFSET, SEMAPHORE_STRIDE};
    use std::time::Duration;

    #[test]
    fn test_layout_matches_rm() {
        let (_sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, 64).unwrap();
        assert_eq!(surface.layout().slot_size, SEMAPHORE_STRIDE);
        assert_eq!(surface.layout().max_submitted_offset, MAX_SUBMITTED_OFFSET);
        assert_eq!(surface.slots(), PAGE_SIZE / SEMAPHORE_STRIDE);
        assert_eq!(
            surface.gpu_address(2).unwrap(),
            surface.gpu_address(0).unwrap() + 2 * SEMAPHORE_STRIDE
        );
        assert!(surface.gpu_address(surface.slots()).is_err());
    }

    #[test]
    fn test_set_and_get_64bit() {
        let (_sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        surface.set_value(3, 0x1_2345_6789).unwrap();
        assert_eq!(surface.get_value(3).unwrap(), 0x1_2345_6789);
        assert_eq!(surface.get_value(2).unwrap(), 0);
    }

    #[test]
    fn test_32bit_values_are_reconstructed() {
        let config = SimConfig {
            semaphores_64bit: false,
            ..SimConfig::default()
        };
        let (_sim, device) = open_sim(config);
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        assert!(!surface.layout().supports_64bit);

        surface.set_value(0, 0xFFFF_FFFE).unwrap();
        assert_eq!(surface.get_value(0).unwrap(), 0xFFFF_FFFE);

        // Work up to 0x1_0000_0001 is announced; the GPU has not wrapped yet.
        surface.set_max_submitted(0, 0x1_0000_0001).unwrap();
        assert_eq!(surface.get_value(0).unwrap(), 0xFFFF_FFFE);

        // The GPU writes only the low word.
        surface.memory.cpu().atomic_u32(0).store(1, Ordering::Release);
        assert_eq!(surface.get_value(0).unwrap(), 0x1_0000_0001);
    }

    #[test]
    fn test_max_submitted_only_moves_forward() {
        let (_sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        surface.set_max_submitted(1, 10).unwrap();
        surface.set_max_submitted(1, 4).unwrap();
        assert_eq!(surface.max_submitted(1).unwrap(), 10);
        // An administrative set resets it.
        surface.set_value(1, 2).unwrap();
        assert_eq!(surface.max_submitted(1).unwrap(), 2);
    }

    #[test]
    fn test_too_many_indices_rejected_without_a_call() {
        let (sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        let controls = sim.stats().calls(Escape::RmControl);
        let indices = vec![0u32; SEMSURF_MAX_NOTIFY_INDICES + 1];

        let err = surface.bind_channel(0x1234, &indices).unwrap_err();
        assert_eq!(err.status(), status::NV_ERR_INVALID_ARGUMENT);
        let err = surface.unbind_channel(0x1234, &indices).unwrap_err();
        assert_eq!(err.status(), status::NV_ERR_INVALID_ARGUMENT);
        assert_eq!(sim.stats().calls(Escape::RmControl), controls);
    }

    #[test]
    fn test_waiter_signals_event() {
        let (_sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        let event = OsEvent::new(device.rm(), device.handle()).unwrap();

        surface.register_waiter(0, 5, 0, event.notification_handle()).unwrap();
        assert!(!event.wait(Duration::from_millis(1)).unwrap());
        surface.set_value(0, 5).unwrap();
        assert!(event.wait(Duration::from_millis(1)).unwrap());

        // Fired waiters are removed.
        let err = surface
            .unregister_waiter(0, 5, event.notification_handle())
            .unwrap_err();
        assert!(err.is_status(status::NV_ERR_OBJECT_NOT_FOUND));
    }

    #[test]
    fn test_waiter_new_value_written_on_fire() {
        let (_sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        let event = OsEvent::new(device.rm(), device.handle()).unwrap();
        surface.register_waiter(1, 3, 100, event.notification_handle()).unwrap();
        surface.set_value(1, 3).unwrap();
        assert_eq!(surface.get_value(1).unwrap(), 100);
    }

    #[test]
    fn test_register_waiter_index_checked() {
        let (_sim, device) = open_sim(SimConfig::default());
        let surface = SemaphoreSurface::create(&device, PAGE_SIZE).unwrap();
        let err = surface
            .register_waiter(surface.slots(), 1, 0, 100)
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_unwinds() {
        let (sim, device) = open_sim(SimConfig::default());
        let before = sim.stats();
        for n in 1..=5 {
            sim.fail_nth_call(n);
            assert!(SemaphoreSurface::create(&device, PAGE_SIZE).is_err());
            let stats = sim.stats();
            assert_eq!(stats.live_objects, before.live_objects);
            assert_eq!(stats.live_cpu_mappings, before.live_cpu_mappings);
            assert_eq!(stats.teardown_violations, 0);
        }
        sim.clear_failure();
        drop(SemaphoreSurface::create(&device, PAGE_SIZE).unwrap());
        assert_eq!(sim.stats().live_objects, before.live_objects);
    }
}
