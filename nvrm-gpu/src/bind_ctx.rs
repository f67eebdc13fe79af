// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory-bind engine context.
//!
//! Binds are carried out by the resource manager when they are issued, so a
//! batch is complete as soon as [`BindContext::exec`] returns.

use std::sync::Arc;

use log::{debug, warn};

use crate::device::Device;
use crate::error::GpuResult;
use crate::exec_ctx::SyncPoint;
use crate::memory::{PhysicalMemory, VirtualRange};

/// One operation in a bind batch.
pub enum BindOp<'a> {
    Bind {
        range: &'a mut VirtualRange,
        va_offset: u64,
        memory: &'a Arc<PhysicalMemory>,
        mem_offset: u64,
        size: u64,
    },
    Unbind {
        range: &'a mut VirtualRange,
        va_offset: u64,
        size: u64,
    },
}

pub struct BindContext {
    device: Arc<Device>,
    applied: u64,
}

impl BindContext {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: device.clone(),
            applied: 0,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Operations applied over the lifetime of the context.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Apply `ops` in order. The first failing operation stops the batch;
    /// the ones before it stay applied.
    pub fn exec<'a>(&mut self, ops: impl IntoIterator<Item = BindOp<'a>>) -> GpuResult<()> {
        for (n, op) in ops.into_iter().enumerate() {
            let result = match op {
                BindOp::Bind {
                    range,
                    va_offset,
                    memory,
                    mem_offset,
                    size,
                } => range.bind(va_offset, memory, mem_offset, size).map(|_| ()),
                BindOp::Unbind {
                    range,
                    va_offset,
                    size,
                } => range.unbind(va_offset, size),
            };
            if let Err(e) = result {
                warn!("bind: operation {n} of batch failed: {e}");
                return Err(e);
            }
            self.applied += 1;
        }
        Ok(())
    }

    /// Nothing is ever queued.
    pub fn flush(&mut self) -> GpuResult<()> {
        Ok(())
    }

    /// Advance each timeline to its value from the CPU.
    pub fn signal(&mut self, syncs: &[SyncPoint<'_>]) -> GpuResult<()> {
        for sync in syncs {
            sync.timeline.signal(sync.value)?;
        }
        debug!("bind: signalled {} timelines", syncs.len());
        Ok(())
    }
}

impl std::fmt::Debug for BindContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindContext")
            .field("applied", &self.applied)
            .finish()
    }
}
