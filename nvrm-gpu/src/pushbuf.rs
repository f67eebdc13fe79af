// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command stream encoder.
//!
//! Emits incrementing-method instructions: a header word followed by one
//! payload word per consecutive method. Host semaphore encodings are taken
//! from the device's [`ArchTable`].

use nvrm_common::classes::host::{self, legacy, modern};
use nvrm_common::{ArchTable, GpuVa, HostSemaphore, SubChannel};

use crate::error::{GpuError, GpuResult};

const SEC_OP_INC_METHOD: u32 = 1;
const MAX_METHOD_COUNT: usize = 0x1FFF;

/// Subchannel used for host (channel) methods.
const HOST_SUBCHANNEL: u32 = 0;

/// Header word for `count` incrementing writes starting at `method`.
pub fn method_header(subchannel: u32, method: u32, count: u32) -> u32 {
    (SEC_OP_INC_METHOD << 29)
        | ((count & MAX_METHOD_COUNT as u32) << 16)
        | ((subchannel & 7) << 13)
        | ((method >> 2) & 0x1FFF)
}

/// A growable command stream with a fixed word capacity.
#[derive(Debug, Clone)]
pub struct CommandStream {
    words: Vec<u32>,
    capacity: usize,
    arch: &'static ArchTable,
    wide_semaphores: bool,
}

impl CommandStream {
    /// `wide_semaphores` selects 64-bit release and acquire payloads; it is
    /// ignored on generations with only the legacy method set.
    pub fn new(arch: &'static ArchTable, wide_semaphores: bool, capacity: usize) -> Self {
        Self {
            words: Vec::new(),
            capacity,
            arch,
            wide_semaphores: wide_semaphores && arch.supports_64bit_semaphores(),
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn wide_semaphores(&self) -> bool {
        self.wide_semaphores
    }

    fn reserve(&mut self, needed: usize) -> GpuResult<()> {
        if self.words.len() + needed > self.capacity {
            return Err(GpuError::CommandBufferFull {
                needed,
                capacity: self.capacity - self.words.len(),
            });
        }
        Ok(())
    }

    /// Write `data` to consecutive methods starting at `method`.
    pub fn method(&mut self, subchannel: u32, method: u32, data: &[u32]) -> GpuResult<()> {
        if data.is_empty() || data.len() > MAX_METHOD_COUNT {
            return Err(GpuError::InvalidArgument("method data length"));
        }
        self.reserve(data.len() + 1)?;
        self.words
            .push(method_header(subchannel, method, data.len() as u32));
        self.words.extend_from_slice(data);
        Ok(())
    }

    /// Bind this generation's engine class for `subc` to that subchannel.
    pub fn set_object(&mut self, subc: SubChannel) -> GpuResult<()> {
        let class = self.arch.subchannel_class(subc);
        self.method(subc as u32, host::SET_OBJECT, &[class])
    }

    /// Drain the whole pipeline before continuing.
    pub fn wait_for_idle(&mut self) -> GpuResult<()> {
        self.method(HOST_SUBCHANNEL, host::WFI, &[host::WFI_SCOPE_ALL])
    }

    pub fn non_stall_interrupt(&mut self) -> GpuResult<()> {
        self.method(HOST_SUBCHANNEL, host::NON_STALL_INTERRUPT, &[0])
    }

    /// Write `value` to `address` once prior work is done, then raise a
    /// non-stalling interrupt so the host is notified.
    pub fn semaphore_release(&mut self, address: GpuVa, value: u64, wait_for_idle: bool) -> GpuResult<()> {
        if address & 3 != 0 {
            return Err(GpuError::InvalidArgument("semaphore address alignment"));
        }
        if wait_for_idle {
            self.wait_for_idle()?;
        }
        match self.arch.host_semaphore {
            HostSemaphore::Modern => {
                let mut execute = modern::OPERATION_RELEASE;
                if wait_for_idle {
                    execute |= modern::RELEASE_WFI_EN;
                }
                if self.wide_semaphores {
                    execute |= modern::PAYLOAD_SIZE_64BIT;
                }
                self.modern_semaphore(address, value, execute)?;
            }
            HostSemaphore::Legacy => {
                let mut op = legacy::OPERATION_RELEASE | legacy::RELEASE_SIZE_4BYTE;
                if !wait_for_idle {
                    op |= legacy::RELEASE_WFI_DIS;
                }
                self.legacy_semaphore(address, value, op)?;
            }
        }
        self.non_stall_interrupt()
    }

    /// Stall this channel until the value at `address` is at least `value`.
    pub fn semaphore_acquire(&mut self, address: GpuVa, value: u64) -> GpuResult<()> {
        if address & 3 != 0 {
            return Err(GpuError::InvalidArgument("semaphore address alignment"));
        }
        match self.arch.host_semaphore {
            HostSemaphore::Modern => {
                let mut execute = modern::OPERATION_ACQ_STRICT_GEQ | modern::ACQUIRE_SWITCH_TSG_EN;
                if self.wide_semaphores {
                    execute |= modern::PAYLOAD_SIZE_64BIT;
                }
                self.modern_semaphore(address, value, execute)
            }
            HostSemaphore::Legacy => {
                self.legacy_semaphore(address, value, legacy::OPERATION_ACQ_GEQ | legacy::ACQUIRE_SWITCH_ENABLED)
            }
        }
    }

    fn modern_semaphore(&mut self, address: GpuVa, value: u64, execute: u32) -> GpuResult<()> {
        self.method(
            HOST_SUBCHANNEL,
            modern::SEM_ADDR_LO,
            &[
                address as u32,
                (address >> 32) as u32 & modern::ADDR_HI_MASK,
                value as u32,
                (value >> 32) as u32,
                execute,
            ],
        )
    }

    fn legacy_semaphore(&mut self, address: GpuVa, value: u64, op: u32) -> GpuResult<()> {
        self.method(
            HOST_SUBCHANNEL,
            legacy::SEMAPHOREA,
            &[(address >> 32) as u32 & 0xFF, address as u32, value as u32, op],
        )
    }
}
