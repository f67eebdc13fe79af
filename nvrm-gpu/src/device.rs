// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device bring-up: client, device, subdevice, doorbell page and the shared
//! GPU virtual address space.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use nvrm_client::params::{
    ctrl, CardInfo, ClassListParams, DeviceAllocParams, NoParams, SubdeviceAllocParams,
    VaSpaceAllocParams,
};
use nvrm_client::{RmClient, RmMapping, RmObject, RmTransport};
use nvrm_common::classes::{class, USERMODE_MAP_SIZE, USERMODE_NOTIFY_CHANNEL_PENDING};
use nvrm_common::{ArchTable, GpuArch, Handle, Settings};

use crate::error::{GpuError, GpuResult};
use crate::semaphore::SemaphoreLayout;
use crate::va::VaHeap;

/// An opened GPU.
///
/// Everything allocated on the device holds an `Arc<Device>`, so the device
/// objects are released only after all of their children.
pub struct Device {
    // Drop order is teardown order.
    usermode_map: Option<RmMapping>,
    _usermode: Option<RmObject>,
    va_space: RmObject,
    subdevice: RmObject,
    device: RmObject,
    rm: Arc<RmClient>,

    arch: &'static ArchTable,
    semaphore_layout: SemaphoreLayout,
    va_heap: Mutex<VaHeap>,
    settings: Settings,
    card: CardInfo,
}

impl Device {
    /// Bring up the card described by `card`. A failure at any step releases
    /// whatever was already allocated, newest first.
    pub fn open(
        transport: Arc<dyn RmTransport>,
        card: &CardInfo,
        settings: &Settings,
    ) -> GpuResult<Arc<Self>> {
        let rm = RmClient::new(transport)?;

        let mut params = DeviceAllocParams {
            device_id: card.minor_number,
            ..Default::default()
        };
        let device = RmObject::alloc(&rm, rm.handle(), class::NV01_DEVICE_0, &mut params)?;

        let mut params = SubdeviceAllocParams::default();
        let subdevice = RmObject::alloc(&rm, device.handle(), class::NV20_SUBDEVICE_0, &mut params)?;

        let mut classes = ClassListParams::default();
        device.control(ctrl::DEVICE_GET_CLASSLIST_V2, &mut classes)?;
        let arch = GpuArch::from_class_list(classes.classes())
            .ok_or(GpuError::UnsupportedArch)?
            .table();

        let usermode = match arch.usermode {
            Some(class) => Some(RmObject::alloc(&rm, subdevice.handle(), class, &mut NoParams)?),
            None => None,
        };
        let usermode_map = match &usermode {
            Some(obj) => Some(RmMapping::new(
                &rm,
                subdevice.handle(),
                obj.handle(),
                0,
                USERMODE_MAP_SIZE,
            )?),
            None => None,
        };

        let mut params = VaSpaceAllocParams {
            va_base: 0,
            va_size: settings.va_end,
            ..Default::default()
        };
        let va_space = RmObject::alloc(&rm, device.handle(), class::FERMI_VASPACE_A, &mut params)?;

        let semaphore_layout = SemaphoreLayout::query(&subdevice, arch)?;

        info!(
            "device: opened gpu 0x{:X} (minor {}) as {:?}, {}-bit semaphores",
            card.gpu_id,
            card.minor_number,
            arch.arch,
            if semaphore_layout.supports_64bit { 64 } else { 32 }
        );

        Ok(Arc::new(Self {
            usermode_map,
            _usermode: usermode,
            va_space,
            subdevice,
            device,
            rm,
            arch,
            semaphore_layout,
            va_heap: Mutex::new(VaHeap::new(settings.va_start, settings.va_end)),
            settings: settings.clone(),
            card: *card,
        }))
    }

    pub fn rm(&self) -> &Arc<RmClient> {
        &self.rm
    }

    pub fn handle(&self) -> Handle {
        self.device.handle()
    }

    pub fn subdevice_handle(&self) -> Handle {
        self.subdevice.handle()
    }

    pub fn va_space_handle(&self) -> Handle {
        self.va_space.handle()
    }

    pub fn arch(&self) -> &'static ArchTable {
        self.arch
    }

    pub fn semaphore_layout(&self) -> SemaphoreLayout {
        self.semaphore_layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn card(&self) -> &CardInfo {
        &self.card
    }

    pub(crate) fn va_heap(&self) -> &Mutex<VaHeap> {
        &self.va_heap
    }

    /// Whether channels on this device are notified through a doorbell.
    pub fn has_doorbell(&self) -> bool {
        self.usermode_map.is_some()
    }

    /// Notify the GPU that the channel owning `token` has new work. All ring
    /// and USERD writes must be visible before this store.
    pub fn ring_doorbell(&self, token: u32) {
        let Some(page) = &self.usermode_map else {
            return;
        };
        fence(Ordering::SeqCst);
        page.atomic_u32(USERMODE_NOTIFY_CHANNEL_PENDING)
            .store(token, Ordering::Release);
        debug!("device: doorbell token 0x{token:X}");
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("arch", &self.arch.arch)
            .field("device", &self.device)
            .field("minor", &self.card.minor_number)
            .finish()
    }
}
