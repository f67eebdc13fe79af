// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Owned resource manager handles.
//!
//! Every object the client allocates is held by exactly one move-only owner
//! that frees it once, either explicitly through `free` (which reports the
//! result) or on drop (which logs failures and carries on).

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use nvrm_common::{Handle, NULL_HANDLE};

use crate::client::RmClient;
use crate::error::RmResult;
use crate::mapping::CpuMapping;
use crate::params::Wire;
use crate::transport::EventFd;

/// An allocated resource manager object.
pub struct RmObject {
    rm: Arc<RmClient>,
    handle: Handle,
    class: u32,
}

impl RmObject {
    /// Allocate `class` under `parent` and take ownership of the new handle.
    pub fn alloc<P: Wire>(
        rm: &Arc<RmClient>,
        parent: Handle,
        class: u32,
        params: &mut P,
    ) -> RmResult<Self> {
        let handle = rm.alloc(parent, class, params)?;
        Ok(Self {
            rm: rm.clone(),
            handle,
            class,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    pub fn client(&self) -> &Arc<RmClient> {
        &self.rm
    }

    /// Issue a control call against this object.
    pub fn control<P: Wire>(&self, cmd: u32, params: &mut P) -> RmResult<()> {
        self.rm.control(self.handle, cmd, params)
    }

    /// Free the object now and report the result.
    pub fn free(mut self) -> RmResult<()> {
        let handle = std::mem::replace(&mut self.handle, NULL_HANDLE);
        self.rm.free(handle)
    }
}

impl Drop for RmObject {
    fn drop(&mut self) {
        if self.handle == NULL_HANDLE {
            return;
        }
        if let Err(e) = self.rm.free(self.handle) {
            warn!(
                "rm: failed to free object 0x{:08X} (class 0x{:04X}): {e}",
                self.handle, self.class
            );
        }
    }
}

impl std::fmt::Debug for RmObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RmObject(0x{:08X}, class 0x{:04X})", self.handle, self.class)
    }
}

/// A CPU mapping that is undone through the resource manager when dropped.
///
/// Remembers the exact extent it was created with so the unmap call always
/// matches the map call.
pub struct RmMapping {
    rm: Arc<RmClient>,
    h_device: Handle,
    h_memory: Handle,
    mapping: Option<CpuMapping>,
}

impl RmMapping {
    pub fn new(
        rm: &Arc<RmClient>,
        h_device: Handle,
        h_memory: Handle,
        offset: u64,
        length: u64,
    ) -> RmResult<Self> {
        let mapping = rm.map_memory(h_device, h_memory, offset, length, 0)?;
        Ok(Self {
            rm: rm.clone(),
            h_device,
            h_memory,
            mapping: Some(mapping),
        })
    }

    pub fn memory(&self) -> Handle {
        self.h_memory
    }

    /// Unmap now and report the result.
    pub fn unmap(mut self) -> RmResult<()> {
        match self.mapping.take() {
            Some(m) => self.rm.unmap_memory(self.h_device, self.h_memory, m, 0),
            None => Ok(()),
        }
    }
}

impl Deref for RmMapping {
    type Target = CpuMapping;

    fn deref(&self) -> &CpuMapping {
        // Only `unmap` and `drop` take the mapping, and both consume self.
        match &self.mapping {
            Some(m) => m,
            None => unreachable!("RmMapping used after unmap"),
        }
    }
}

impl Drop for RmMapping {
    fn drop(&mut self) {
        if let Some(m) = self.mapping.take() {
            if let Err(e) = self.rm.unmap_memory(self.h_device, self.h_memory, m, 0) {
                warn!("rm: failed to unmap memory 0x{:08X}: {e}", self.h_memory);
            }
        }
    }
}

impl std::fmt::Debug for RmMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmMapping")
            .field("h_memory", &format_args!("0x{:08X}", self.h_memory))
            .field("mapping", &self.mapping)
            .finish()
    }
}

/// A private notification descriptor registered with the resource manager.
pub struct OsEvent {
    rm: Arc<RmClient>,
    h_device: Handle,
    fd: EventFd,
}

impl OsEvent {
    /// Open a descriptor and attach it to the client under `h_device`.
    pub fn new(rm: &Arc<RmClient>, h_device: Handle) -> RmResult<Self> {
        let transport = rm.transport();
        let fd = transport.open_event()?;
        if let Err(e) = rm.alloc_os_event(h_device, fd) {
            transport.close_event(fd);
            return Err(e);
        }
        Ok(Self {
            rm: rm.clone(),
            h_device,
            fd,
        })
    }

    pub fn fd(&self) -> EventFd {
        self.fd
    }

    /// Value to pass as a waiter's notification handle.
    pub fn notification_handle(&self) -> u64 {
        self.fd.notification_handle()
    }

    /// Wait up to `timeout` for the descriptor to be signalled. A `true`
    /// return may be spurious; callers re-check their condition.
    pub fn wait(&self, timeout: Duration) -> RmResult<bool> {
        Ok(self.rm.transport().poll_event(self.fd, timeout)?)
    }
}

impl Drop for OsEvent {
    fn drop(&mut self) {
        if let Err(e) = self.rm.free_os_event(self.h_device, self.fd) {
            warn!("rm: failed to free os event fd={}: {e}", self.fd.0);
        }
        self.rm.transport().close_event(self.fd);
    }
}

impl std::fmt::Debug for OsEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OsEvent(fd={})", self.fd.0)
    }
}
