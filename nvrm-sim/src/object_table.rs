// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Privileged-side object graph.
//!
//! Every object has a parent; freeing an object frees its whole subtree, the
//! way the real resource manager does. Handles are never reused, so a second
//! free of the same handle is recognisable as a double free.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use nvrm_client::CpuMapping;
use nvrm_common::status::{self, NvStatus};
use nvrm_common::{Handle, NULL_HANDLE};

use crate::front_end::HostLatch;

/// Maximum number of live objects across all clients.
const MAX_OBJECTS: usize = 4096;

/// First handle handed out.
const FIRST_HANDLE: Handle = 0xCAFE_0001;

/// A physical allocation.
pub struct MemoryObject {
    pub backing: Arc<CpuMapping>,
    pub size: u64,
    pub system: bool,
    pub kind: u32,
    /// Live GPU mappings into virtual objects.
    pub dma_mappings: u32,
    /// Live CPU mappings.
    pub cpu_mappings: u32,
}

/// One physical range mapped into a virtual object.
#[derive(Debug, Clone, Copy)]
pub struct DmaMapping {
    pub h_memory: Handle,
    pub length: u64,
}

/// A reservation of GPU virtual address space.
pub struct VirtualObject {
    pub h_va_space: Handle,
    pub base: u64,
    pub size: u64,
    pub kind: u32,
    /// GPU VA → mapping.
    pub mappings: BTreeMap<u64, DmaMapping>,
}

impl VirtualObject {
    pub fn contains(&self, va: u64, length: u64) -> bool {
        va >= self.base && length <= self.size && va - self.base <= self.size - length
    }

    pub fn overlaps_mapping(&self, va: u64, length: u64) -> bool {
        self.mappings
            .iter()
            .any(|(&start, m)| va < start + m.length && start < va + length)
    }
}

/// A GPFIFO channel.
pub struct ChannelObject {
    pub token: u32,
    /// Runlist engine; copy channels only accept the copy class.
    pub engine_type: u32,
    pub gpfifo_va: u64,
    pub entries: u32,
    pub userd: Arc<CpuMapping>,
    pub userd_offset: usize,
    pub scheduled: bool,
    pub doorbell_pending: bool,
    /// Engine class bound to each subchannel by SET_OBJECT.
    pub subchannels: [u32; 8],
    pub host: HostLatch,
}

/// A waiter registered on a semaphore surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub index: u64,
    pub wait_value: u64,
    pub new_value: u64,
    pub fd: i32,
}

/// A semaphore surface.
pub struct SurfaceObject {
    pub h_semaphore_mem: Handle,
    pub h_max_submitted_mem: Handle,
    /// Bound channels with their notification indices.
    pub channels: Vec<(Handle, Vec<u32>)>,
    pub waiters: Vec<Waiter>,
}

pub enum ObjectKind {
    Client,
    Device { device_id: u32 },
    Subdevice,
    Usermode { page: Arc<CpuMapping> },
    VaSpace,
    Memory(MemoryObject),
    Virtual(VirtualObject),
    ContextDma { h_memory: Handle },
    Channel(Box<ChannelObject>),
    Engine,
    SemaphoreSurface(SurfaceObject),
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Device { .. } => "device",
            Self::Subdevice => "subdevice",
            Self::Usermode { .. } => "usermode",
            Self::VaSpace => "vaspace",
            Self::Memory(_) => "memory",
            Self::Virtual(_) => "virtual",
            Self::ContextDma { .. } => "ctxdma",
            Self::Channel(_) => "channel",
            Self::Engine => "engine",
            Self::SemaphoreSurface(_) => "semsurf",
        }
    }
}

pub struct SimObject {
    pub class: u32,
    pub parent: Handle,
    pub client: Handle,
    pub kind: ObjectKind,
}

/// Handle table: maps Handle -> SimObject.
pub struct ObjectTable {
    objects: HashMap<Handle, SimObject>,
    freed: HashSet<Handle>,
    next_handle: Handle,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            freed: HashSet::new(),
            next_handle: FIRST_HANDLE,
        }
    }

    /// Add an object and return its handle. `parent` must exist unless the
    /// object is a root client.
    pub fn add(
        &mut self,
        client: Handle,
        parent: Handle,
        class: u32,
        kind: ObjectKind,
    ) -> Result<Handle, NvStatus> {
        if self.objects.len() >= MAX_OBJECTS {
            return Err(status::NV_ERR_INSUFFICIENT_RESOURCES);
        }
        let is_client = matches!(kind, ObjectKind::Client);
        if !is_client && !self.objects.contains_key(&parent) {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        if self.next_handle == NULL_HANDLE {
            self.next_handle = FIRST_HANDLE;
        }

        let client = if is_client { handle } else { client };
        self.objects.insert(
            handle,
            SimObject {
                class,
                parent,
                client,
                kind,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Result<&SimObject, NvStatus> {
        self.objects
            .get(&handle)
            .ok_or(status::NV_ERR_INVALID_OBJECT_HANDLE)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut SimObject, NvStatus> {
        self.objects
            .get_mut(&handle)
            .ok_or(status::NV_ERR_INVALID_OBJECT_HANDLE)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn memory(&self, handle: Handle) -> Result<&MemoryObject, NvStatus> {
        match &self.get(handle)?.kind {
            ObjectKind::Memory(m) => Ok(m),
            _ => Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        }
    }

    pub fn memory_mut(&mut self, handle: Handle) -> Result<&mut MemoryObject, NvStatus> {
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::Memory(m) => Ok(m),
            _ => Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        }
    }

    pub fn virtual_mut(&mut self, handle: Handle) -> Result<&mut VirtualObject, NvStatus> {
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::Virtual(v) => Ok(v),
            _ => Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        }
    }

    pub fn channel_mut(&mut self, handle: Handle) -> Result<&mut ChannelObject, NvStatus> {
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::Channel(c) => Ok(c),
            _ => Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        }
    }

    pub fn surface(&self, handle: Handle) -> Result<&SurfaceObject, NvStatus> {
        match &self.get(handle)?.kind {
            ObjectKind::SemaphoreSurface(s) => Ok(s),
            _ => Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        }
    }

    pub fn surface_mut(&mut self, handle: Handle) -> Result<&mut SurfaceObject, NvStatus> {
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::SemaphoreSurface(s) => Ok(s),
            _ => Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        }
    }

    /// Whether `handle` existed once and has since been freed.
    pub fn was_freed(&self, handle: Handle) -> bool {
        self.freed.contains(&handle)
    }

    /// Remove `handle` and every descendant. Descendants come first in the
    /// returned list, deepest first.
    pub fn remove_tree(&mut self, handle: Handle) -> Result<Vec<(Handle, SimObject)>, NvStatus> {
        if !self.objects.contains_key(&handle) {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }
        let mut order = vec![handle];
        let mut i = 0;
        while i < order.len() {
            let parent = order[i];
            order.extend(
                self.objects
                    .iter()
                    .filter(|(&h, o)| o.parent == parent && h != parent)
                    .map(|(&h, _)| h),
            );
            i += 1;
        }
        let mut removed = Vec::with_capacity(order.len());
        for h in order.into_iter().rev() {
            if let Some(obj) = self.objects.remove(&h) {
                self.freed.insert(h);
                removed.push((h, obj));
            }
        }
        Ok(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Handle, &SimObject)> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Handle, &mut SimObject)> {
        self.objects.iter_mut()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
