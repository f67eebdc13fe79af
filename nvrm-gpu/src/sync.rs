// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Timeline synchronization objects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use nvrm_client::OsEvent;
use nvrm_common::status;
use nvrm_common::{GpuVa, PAGE_SIZE};

use crate::device::Device;
use crate::error::{GpuError, GpuResult};
use crate::semaphore::SemaphoreSurface;

const SLOT: u64 = 0;

/// A monotonically increasing 64-bit counter in a semaphore surface that
/// both the CPU and GPU can signal and wait on.
pub struct TimelineSync {
    surface: SemaphoreSurface,
    event: OsEvent,
    device: Arc<Device>,
}

impl TimelineSync {
    pub fn new(device: &Arc<Device>, initial: u64) -> GpuResult<Self> {
        let event = OsEvent::new(device.rm(), device.handle())?;
        let surface = SemaphoreSurface::create(device, PAGE_SIZE)?;
        if initial != 0 {
            surface.set_value(SLOT, initial)?;
        }
        Ok(Self {
            surface,
            event,
            device: device.clone(),
        })
    }

    pub fn value(&self) -> GpuResult<u64> {
        self.surface.get_value(SLOT)
    }

    /// GPU address that release and acquire methods target.
    pub fn gpu_address(&self) -> GpuResult<GpuVa> {
        self.surface.gpu_address(SLOT)
    }

    /// Advance the timeline to `value` from the CPU.
    pub fn signal(&self, value: u64) -> GpuResult<()> {
        if value < self.value()? {
            return Err(GpuError::InvalidArgument("timeline value must not decrease"));
        }
        self.surface.set_value(SLOT, value)
    }

    /// Set the timeline to `value`, which may be lower than the current one.
    /// No GPU work targeting the timeline may be outstanding.
    pub fn reset(&self, value: u64) -> GpuResult<()> {
        self.surface.set_value(SLOT, value)
    }

    /// Record that GPU work releasing `value` is about to be submitted.
    pub(crate) fn announce(&self, value: u64) -> GpuResult<()> {
        self.surface.set_max_submitted(SLOT, value)
    }

    /// Block until the timeline reaches `value` or `timeout` elapses.
    /// Returns whether the value was reached.
    pub fn wait(&self, value: u64, timeout: Duration) -> GpuResult<bool> {
        if self.value()? >= value {
            return Ok(true);
        }
        let handle = self.event.notification_handle();
        self.surface.register_waiter(SLOT, value, 0, handle)?;

        let deadline = Instant::now() + timeout;
        let poll = self.device.settings().wait_timeout();
        loop {
            if self.value()? >= value {
                trace!("sync: reached {value}");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.event.wait((deadline - now).min(poll))?;
        }

        debug!("sync: wait for {value} timed out");
        match self.surface.unregister_waiter(SLOT, value, handle) {
            // Fired after the last check.
            Err(e) if e.is_status(status::NV_ERR_OBJECT_NOT_FOUND) => Ok(self.value()? >= value),
            Err(e) => Err(e),
            Ok(()) => Ok(false),
        }
    }
}

impl std::fmt::Debug for TimelineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSync")
            .field("surface", &self.surface)
            .field("event", &self.event)
            .finish()
    }
}
