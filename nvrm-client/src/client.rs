// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed wrapper over the resource manager escapes.
//!
//! Each call builds one fixed-layout request (escape header followed by the
//! class or control parameter block), pushes it through the transport and
//! decodes the reply in place. Transport failures are retried for
//! `EINTR`/`EAGAIN` only; in-band failures are never retried.

use std::io::Cursor;
use std::sync::Arc;

use log::{trace, warn};

use nvrm_common::classes::class;
use nvrm_common::status;
use nvrm_common::{Handle, NULL_HANDLE};

use crate::error::{check, RmError, RmResult};
use crate::mapping::CpuMapping;
use crate::params::*;
use crate::transport::{EventFd, Escape, RmTransport};

/// Issue one escape, retrying while the transport reports a transient errno.
pub fn issue(transport: &dyn RmTransport, escape: Escape, buf: &mut [u8]) -> RmResult<()> {
    loop {
        match transport.ioctl(escape, buf) {
            Ok(()) => return Ok(()),
            Err(errno) if errno.is_transient() => {
                trace!("rm: {escape:?} interrupted ({errno}), retrying");
            }
            Err(errno) => return Err(RmError::Transport { escape, errno }),
        }
    }
}

/// Send `header` immediately followed by `params`; decode both back.
fn exchange<H: Wire, P: Wire>(
    transport: &dyn RmTransport,
    escape: Escape,
    op: &'static str,
    header: &H,
    params: &mut P,
) -> RmResult<H> {
    let mut buf = Vec::with_capacity(H::SIZE + P::SIZE);
    header.encode(&mut buf).map_err(|e| RmError::Malformed(op, e))?;
    params.encode(&mut buf).map_err(|e| RmError::Malformed(op, e))?;
    issue(transport, escape, &mut buf)?;

    let mut cur = Cursor::new(&buf[..]);
    let header = H::decode(&mut cur).map_err(|e| RmError::Malformed(op, e))?;
    *params = P::decode(&mut cur).map_err(|e| RmError::Malformed(op, e))?;
    Ok(header)
}

/// Query the fixed-size card table. Only records with `valid != 0` are
/// returned.
pub fn card_info(transport: &dyn RmTransport) -> RmResult<Vec<CardInfo>> {
    let mut buf = vec![0u8; CardInfo::SIZE * MAX_CARDS];
    issue(transport, Escape::CardInfo, &mut buf)?;
    let mut cur = Cursor::new(&buf[..]);
    let mut cards = Vec::new();
    for _ in 0..MAX_CARDS {
        let card = CardInfo::decode(&mut cur).map_err(|e| RmError::Malformed("card info", e))?;
        if card.valid != 0 {
            cards.push(card);
        }
    }
    Ok(cards)
}

/// Ask the resource manager whether it accepts this client's version string.
pub fn check_version(transport: &dyn RmTransport, version: &str) -> RmResult<()> {
    let mut params = CheckVersionParams::new(version);
    let mut buf = params.to_bytes();
    issue(transport, Escape::CheckVersionStr, &mut buf)?;
    params = CheckVersionParams::from_bytes(&buf).map_err(|e| RmError::Malformed("check version", e))?;
    if params.reply == CHECK_VERSION_REPLY_RECOGNIZED {
        Ok(())
    } else {
        Err(RmError::Status {
            op: "check version",
            status: status::NV_ERR_LIB_RM_VERSION_MISMATCH,
        })
    }
}

/// A root client: the namespace every other handle lives in.
///
/// Freed when dropped; every object allocated under it is released by the
/// resource manager at the same time, so owned handles keep an `Arc` to the
/// client to make sure they go first.
pub struct RmClient {
    transport: Arc<dyn RmTransport>,
    h_client: Handle,
}

impl RmClient {
    /// Allocate a new root client.
    pub fn new(transport: Arc<dyn RmTransport>) -> RmResult<Arc<Self>> {
        let header = AllocHeader {
            h_class: class::NV01_ROOT_CLIENT,
            ..Default::default()
        };
        let reply = exchange(
            transport.as_ref(),
            Escape::RmAlloc,
            "alloc root client",
            &header,
            &mut NoParams,
        )?;
        check("alloc root client", reply.status)?;
        trace!(
            "rm: {} root client 0x{:08X}",
            transport.name(),
            reply.h_object_new
        );
        Ok(Arc::new(Self {
            transport,
            h_client: reply.h_object_new,
        }))
    }

    pub fn handle(&self) -> Handle {
        self.h_client
    }

    pub fn transport(&self) -> &Arc<dyn RmTransport> {
        &self.transport
    }

    /// Allocate an object of `class` under `parent`. `params` is updated with
    /// whatever the resource manager wrote back.
    pub fn alloc<P: Wire>(&self, parent: Handle, class: u32, params: &mut P) -> RmResult<Handle> {
        let header = AllocHeader {
            h_root: self.h_client,
            h_object_parent: parent,
            h_object_new: NULL_HANDLE,
            h_class: class,
            params_size: P::SIZE as u32,
            status: 0,
        };
        let reply = exchange(self.transport.as_ref(), Escape::RmAlloc, "alloc", &header, params)?;
        check("alloc", reply.status)?;
        trace!(
            "rm: alloc class=0x{:04X} parent=0x{:08X} -> 0x{:08X}",
            class,
            parent,
            reply.h_object_new
        );
        Ok(reply.h_object_new)
    }

    /// Free `handle`. Freeing the null handle is a successful no-op.
    pub fn free(&self, handle: Handle) -> RmResult<()> {
        if handle == NULL_HANDLE {
            return Ok(());
        }
        let mut params = FreeParams {
            h_root: self.h_client,
            h_object_parent: NULL_HANDLE,
            h_object_old: handle,
            status: 0,
        };
        let mut buf = params.to_bytes();
        issue(self.transport.as_ref(), Escape::RmFree, &mut buf)?;
        params = FreeParams::from_bytes(&buf).map_err(|e| RmError::Malformed("free", e))?;
        check("free", params.status)?;
        trace!("rm: free 0x{handle:08X}");
        Ok(())
    }

    /// Issue control command `cmd` against `object`.
    pub fn control<P: Wire>(&self, object: Handle, cmd: u32, params: &mut P) -> RmResult<()> {
        let header = ControlHeader {
            h_client: self.h_client,
            h_object: object,
            cmd,
            flags: 0,
            params_size: P::SIZE as u32,
            status: 0,
        };
        let reply = exchange(self.transport.as_ref(), Escape::RmControl, "control", &header, params)?;
        check("control", reply.status)?;
        trace!("rm: control 0x{cmd:08X} on 0x{object:08X}");
        Ok(())
    }

    /// Map `length` bytes of `memory` at `offset` for CPU access.
    pub fn map_memory(
        &self,
        h_device: Handle,
        h_memory: Handle,
        offset: u64,
        length: u64,
        flags: u32,
    ) -> RmResult<CpuMapping> {
        let mut params = MapMemoryParams {
            h_client: self.h_client,
            h_device,
            h_memory,
            offset,
            length,
            flags,
            ..Default::default()
        };
        let mut buf = params.to_bytes();
        issue(self.transport.as_ref(), Escape::RmMapMemory, &mut buf)?;
        params = MapMemoryParams::from_bytes(&buf).map_err(|e| RmError::Malformed("map memory", e))?;
        check("map memory", params.status)?;

        match self.transport.mmap(params.linear_address, length) {
            Ok(mapping) => {
                trace!(
                    "rm: map memory 0x{h_memory:08X} +0x{offset:X} len=0x{length:X} -> 0x{:X}",
                    params.linear_address
                );
                Ok(mapping)
            }
            Err(e) => {
                if let Err(undo) = self.unmap_linear(h_device, h_memory, params.linear_address, flags) {
                    warn!("rm: failed to undo map of 0x{h_memory:08X}: {undo}");
                }
                Err(RmError::Io(e))
            }
        }
    }

    /// Undo [`RmClient::map_memory`]. The mapping must be the one returned for
    /// `h_memory`; its CPU view is released first.
    pub fn unmap_memory(
        &self,
        h_device: Handle,
        h_memory: Handle,
        mapping: CpuMapping,
        flags: u32,
    ) -> RmResult<()> {
        let linear_address = mapping.linear_address();
        drop(mapping);
        self.unmap_linear(h_device, h_memory, linear_address, flags)
    }

    fn unmap_linear(&self, h_device: Handle, h_memory: Handle, linear_address: u64, flags: u32) -> RmResult<()> {
        let mut params = UnmapMemoryParams {
            h_client: self.h_client,
            h_device,
            h_memory,
            linear_address,
            flags,
            ..Default::default()
        };
        let mut buf = params.to_bytes();
        issue(self.transport.as_ref(), Escape::RmUnmapMemory, &mut buf)?;
        params = UnmapMemoryParams::from_bytes(&buf).map_err(|e| RmError::Malformed("unmap memory", e))?;
        check("unmap memory", params.status)
    }

    /// Map `memory` into the virtual object `h_dma`. Returns the GPU virtual
    /// address of the mapping.
    #[allow(clippy::too_many_arguments)]
    pub fn map_memory_dma(
        &self,
        h_device: Handle,
        h_dma: Handle,
        h_memory: Handle,
        offset: u64,
        length: u64,
        flags: u32,
        dma_offset: u64,
    ) -> RmResult<u64> {
        let mut params = MapMemoryDmaParams {
            h_client: self.h_client,
            h_device,
            h_dma,
            h_memory,
            offset,
            length,
            flags,
            dma_offset,
            ..Default::default()
        };
        let mut buf = params.to_bytes();
        issue(self.transport.as_ref(), Escape::RmMapMemoryDma, &mut buf)?;
        params = MapMemoryDmaParams::from_bytes(&buf).map_err(|e| RmError::Malformed("map memory dma", e))?;
        check("map memory dma", params.status)?;
        trace!(
            "rm: map dma mem=0x{h_memory:08X} into 0x{h_dma:08X} len=0x{length:X} -> 0x{:X}",
            params.dma_offset
        );
        Ok(params.dma_offset)
    }

    pub fn unmap_memory_dma(
        &self,
        h_device: Handle,
        h_dma: Handle,
        h_memory: Handle,
        flags: u32,
        dma_offset: u64,
    ) -> RmResult<()> {
        let mut params = UnmapMemoryDmaParams {
            h_client: self.h_client,
            h_device,
            h_dma,
            h_memory,
            flags,
            dma_offset,
            ..Default::default()
        };
        let mut buf = params.to_bytes();
        issue(self.transport.as_ref(), Escape::RmUnmapMemoryDma, &mut buf)?;
        params = UnmapMemoryDmaParams::from_bytes(&buf).map_err(|e| RmError::Malformed("unmap memory dma", e))?;
        check("unmap memory dma", params.status)
    }

    /// Attach the notification descriptor `fd` to this client.
    pub fn alloc_os_event(&self, h_device: Handle, fd: EventFd) -> RmResult<()> {
        self.os_event(Escape::AllocOsEvent, "alloc os event", h_device, fd)
    }

    pub fn free_os_event(&self, h_device: Handle, fd: EventFd) -> RmResult<()> {
        self.os_event(Escape::FreeOsEvent, "free os event", h_device, fd)
    }

    fn os_event(&self, escape: Escape, op: &'static str, h_device: Handle, fd: EventFd) -> RmResult<()> {
        let mut params = OsEventParams {
            h_client: self.h_client,
            h_device,
            fd: fd.0,
            status: 0,
        };
        let mut buf = params.to_bytes();
        issue(self.transport.as_ref(), escape, &mut buf)?;
        params = OsEventParams::from_bytes(&buf).map_err(|e| RmError::Malformed(op, e))?;
        check(op, params.status)
    }
}

impl Drop for RmClient {
    fn drop(&mut self) {
        let mut params = FreeParams {
            h_root: self.h_client,
            h_object_parent: NULL_HANDLE,
            h_object_old: self.h_client,
            status: 0,
        };
        let mut buf = params.to_bytes();
        let result = issue(self.transport.as_ref(), Escape::RmFree, &mut buf).and_then(|()| {
            params = FreeParams::from_bytes(&buf).map_err(|e| RmError::Malformed("free", e))?;
            check("free root client", params.status)
        });
        if let Err(e) = result {
            warn!("rm: failed to free root client 0x{:08X}: {e}", self.h_client);
        }
    }
}

impl std::fmt::Debug for RmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmClient")
            .field("transport", &self.transport.name())
            .field("h_client", &format_args!("0x{:08X}", self.h_client))
            .finish()
    }
}
