// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software resource manager.
//!
//! [`SoftRm`] answers every escape against an in-process object graph and
//! runs the GPU front-end whenever a thread waits on an event, so submitted
//! work completes inside the wait. It keeps the books tests need (calls per
//! escape, live objects, double frees, objects freed while still in use) and
//! can inject faults on demand.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use nvrm_client::params::*;
use nvrm_client::{CpuMapping, Errno, Escape, EventFd, RmTransport, Wire};
use nvrm_common::classes::{class, engine_type, userd, USERMODE_MAP_SIZE};
use nvrm_common::semaphore::reconstruct_value;
use nvrm_common::status::{self, NvStatus};
use nvrm_common::{
    align_up, is_aligned, ArchTable, GpuArch, Handle, Settings, NULL_HANDLE, PAGE_SIZE,
};

use crate::engine;
use crate::front_end::HostLatch;
use crate::object_table::{
    ChannelObject, DmaMapping, MemoryObject, ObjectKind, ObjectTable, SurfaceObject,
    VirtualObject, Waiter,
};
use crate::page_table::{GpuPageTable, GPU_VA_SIZE};

/// Bytes per semaphore surface slot.
pub const SEMAPHORE_STRIDE: u64 = 16;
/// Offset of the 64-bit "max submitted" shadow inside a slot.
pub const MAX_SUBMITTED_OFFSET: u64 = 8;

/// First opaque linear address handed out by the map-memory escape.
const LINEAR_BASE: u64 = 0x7F00_0000_0000;
/// Placement of virtual allocations that do not ask for a fixed address.
const AUTO_VA_BASE: u64 = 0x80_0000_0000;
const FIRST_EVENT_FD: i32 = 100;
const FIRST_WORK_SUBMIT_TOKEN: u32 = 0x100;
/// Largest single allocation the simulator backs.
const MAX_ALLOCATION: u64 = 1 << 32;
const NVIDIA_VENDOR_ID: u16 = 0x10DE;

/// What the simulated GPU looks like.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub arch: GpuArch,
    /// Whether the semaphore surface reports 64-bit semaphore support.
    /// Ignored on architectures without 64-bit host semaphores.
    pub semaphores_64bit: bool,
    /// Number of cards reported by the card-info escape.
    pub cards: u32,
    /// Version string the version check accepts.
    pub driver_version: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arch: GpuArch::Ampere,
            semaphores_64bit: true,
            cards: 1,
            driver_version: DRIVER_VERSION.to_string(),
        }
    }
}

impl SimConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            arch: settings.sim_arch,
            semaphores_64bit: settings.sim_64bit_semaphores,
            ..Self::default()
        }
    }

    pub fn with_arch(mut self, arch: GpuArch) -> Self {
        self.arch = arch;
        self
    }
}

/// Snapshot of the simulator's bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub calls: HashMap<Escape, u64>,
    pub injected_failures: u64,
    pub injected_interrupts: u64,
    pub spurious_wakeups: u64,
    pub double_frees: u64,
    /// Objects freed while still mapped, bound or holding live children.
    pub teardown_violations: u64,
    pub doorbells: u64,
    pub gp_entries: u64,
    pub semaphore_releases: u64,
    pub semaphore_acquires: u64,
    pub acquire_stalls: u64,
    pub wfis: u64,
    pub non_stall_interrupts: u64,
    pub engine_methods: u64,
    pub invalid_methods: u64,
    pub mmu_faults: u64,
    pub waiters_signalled: u64,

    pub live_objects: usize,
    pub live_cpu_mappings: usize,
    pub live_gpu_mappings: usize,
    pub mapped_gpu_pages: usize,
    pub open_events: usize,
}

impl SimStats {
    pub fn calls(&self, escape: Escape) -> u64 {
        self.calls.get(&escape).copied().unwrap_or(0)
    }

    /// Calls that create something on the privileged side.
    pub fn allocations(&self) -> u64 {
        self.calls(Escape::RmAlloc)
    }
}

#[derive(Default)]
struct Faults {
    fail_countdown: Option<u32>,
    eintr: u32,
    spurious_wakeups: u32,
    kind_override: Option<u32>,
    mismatched_devices: HashSet<u32>,
    reject_version: bool,
    gpu_held: bool,
}

impl Faults {
    /// Count one injectable call; true if it is the one that must fail.
    fn take_failure(&mut self) -> bool {
        match self.fail_countdown {
            Some(n) if n <= 1 => {
                self.fail_countdown = None;
                true
            }
            Some(n) => {
                self.fail_countdown = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

struct CpuMapRecord {
    h_memory: Handle,
    backing: Arc<CpuMapping>,
    offset: usize,
    length: u64,
}

struct EventState {
    /// Client the descriptor is attached to, or `NULL_HANDLE`.
    client: Handle,
    signaled: bool,
}

struct SimState {
    objects: ObjectTable,
    mmu: GpuPageTable,
    stats: SimStats,
    cpu_maps: HashMap<u64, CpuMapRecord>,
    next_linear: u64,
    next_auto_va: u64,
    events: HashMap<i32, EventState>,
    next_fd: i32,
    next_token: u32,
    faults: Faults,
}

/// In-process resource manager and GPU.
pub struct SoftRm {
    config: SimConfig,
    state: Mutex<SimState>,
    wake: Condvar,
}

impl SoftRm {
    pub fn new(config: SimConfig) -> Arc<Self> {
        debug!(
            "sim-rm: {:?} with {} card(s), 64-bit semaphores {}",
            config.arch, config.cards, config.semaphores_64bit
        );
        Arc::new(Self {
            config,
            state: Mutex::new(SimState {
                objects: ObjectTable::new(),
                mmu: GpuPageTable::new(),
                stats: SimStats::default(),
                cpu_maps: HashMap::new(),
                next_linear: LINEAR_BASE,
                next_auto_va: AUTO_VA_BASE,
                events: HashMap::new(),
                next_fd: FIRST_EVENT_FD,
                next_token: FIRST_WORK_SUBMIT_TOKEN,
                faults: Faults::default(),
            }),
            wake: Condvar::new(),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn table(&self) -> &'static ArchTable {
        self.config.arch.table()
    }

    fn wide_semaphores(&self) -> bool {
        self.config.semaphores_64bit && self.table().supports_64bit_semaphores()
    }

    pub fn stats(&self) -> SimStats {
        let st = self.state.lock();
        let mut stats = st.stats.clone();
        stats.live_objects = st.objects.len();
        stats.live_cpu_mappings = st.cpu_maps.len();
        stats.live_gpu_mappings = st
            .objects
            .iter()
            .map(|(_, o)| match &o.kind {
                ObjectKind::Virtual(v) => v.mappings.len(),
                _ => 0,
            })
            .sum();
        stats.mapped_gpu_pages = st.mmu.mapped_pages();
        stats.open_events = st.events.len();
        stats
    }

    // ── Fault injection ──────────────────────────────────────────────────

    /// Fail the `n`th call (counting from 1) that allocates, maps, attaches or
    /// controls, with an in-band `NV_ERR_GENERIC`. Frees and unmaps are never
    /// failed.
    pub fn fail_nth_call(&self, n: u32) {
        self.state.lock().faults.fail_countdown = Some(n.max(1));
    }

    /// Disarm a pending [`SoftRm::fail_nth_call`].
    pub fn clear_failure(&self) {
        self.state.lock().faults.fail_countdown = None;
    }

    /// Fail the next `count` escapes with `EINTR` before touching them.
    pub fn inject_eintr(&self, count: u32) {
        self.state.lock().faults.eintr = count;
    }

    /// Make the next `count` event polls return readable without any work
    /// having completed.
    pub fn spurious_wakeups(&self, count: u32) {
        self.state.lock().faults.spurious_wakeups = count;
    }

    /// Report `kind` as the negotiated page kind of every virtual allocation.
    pub fn override_kind(&self, kind: Option<u32>) {
        self.state.lock().faults.kind_override = kind;
    }

    /// Reject device allocations for `device_id` as a version mismatch.
    pub fn mismatch_device(&self, device_id: u32) {
        self.state.lock().faults.mismatched_devices.insert(device_id);
    }

    pub fn reject_version(&self, reject: bool) {
        self.state.lock().faults.reject_version = reject;
    }

    /// While held, the GPU makes no progress; waits time out.
    pub fn hold_gpu(&self, hold: bool) {
        self.state.lock().faults.gpu_held = hold;
        if !hold {
            self.wake.notify_all();
        }
    }

    /// Run every channel that has work and deliver notifications.
    pub fn run_gpu(&self) {
        let mut st = self.state.lock();
        self.run_gpu_locked(&mut st);
    }

    /// Read words from GPU virtual memory.
    pub fn read_gpu_words(&self, gpu_va: u64, count: usize) -> Option<Vec<u32>> {
        self.state.lock().mmu.read_words(gpu_va, count)
    }

    fn run_gpu_locked(&self, st: &mut SimState) {
        if st.faults.gpu_held {
            return;
        }
        engine::run(
            &mut st.objects,
            &st.mmu,
            &mut st.stats,
            self.table(),
            self.wide_semaphores(),
        );
        self.sweep_all(st);
    }

    // ── Semaphore slots ──────────────────────────────────────────────────

    fn read_slot(&self, backing: &CpuMapping, index: u64) -> u64 {
        let off = (index * SEMAPHORE_STRIDE) as usize;
        if self.wide_semaphores() {
            backing.atomic_u64(off).load(Ordering::Acquire)
        } else {
            let low = backing.atomic_u32(off).load(Ordering::Acquire);
            let shadow = backing
                .atomic_u64(off + MAX_SUBMITTED_OFFSET as usize)
                .load(Ordering::Acquire);
            reconstruct_value(low, shadow)
        }
    }

    fn write_slot(&self, backing: &CpuMapping, index: u64, value: u64) {
        let off = (index * SEMAPHORE_STRIDE) as usize;
        if self.wide_semaphores() {
            backing.atomic_u64(off).store(value, Ordering::Release);
        } else {
            backing.atomic_u32(off).store(value as u32, Ordering::Release);
        }
    }

    /// Semaphore backing of `h_surface` and its number of slots.
    fn surface_backing(
        objects: &ObjectTable,
        h_surface: Handle,
    ) -> Result<(Arc<CpuMapping>, u64), NvStatus> {
        let surface = objects.surface(h_surface)?;
        let memory = objects.memory(surface.h_semaphore_mem)?;
        Ok((memory.backing.clone(), memory.size / SEMAPHORE_STRIDE))
    }

    /// Fire every satisfied waiter on `h_surface`.
    fn sweep_surface(&self, st: &mut SimState, h_surface: Handle) {
        let Ok((backing, _)) = Self::surface_backing(&st.objects, h_surface) else {
            return;
        };
        let mut fired = Vec::new();
        if let Ok(surface) = st.objects.surface_mut(h_surface) {
            surface.waiters.retain(|w| {
                if self.read_slot(&backing, w.index) >= w.wait_value {
                    fired.push(*w);
                    false
                } else {
                    true
                }
            });
        }
        if fired.is_empty() {
            return;
        }
        for w in fired {
            if w.new_value != 0 {
                self.write_slot(&backing, w.index, w.new_value);
            }
            st.stats.waiters_signalled += 1;
            if let Some(event) = st.events.get_mut(&w.fd) {
                event.signaled = true;
            }
            trace!(
                "sim-rm: waiter index={} value={} fired on fd={}",
                w.index,
                w.wait_value,
                w.fd
            );
        }
        self.wake.notify_all();
    }

    fn sweep_all(&self, st: &mut SimState) {
        let surfaces: Vec<Handle> = st
            .objects
            .iter()
            .filter(|(_, o)| matches!(o.kind, ObjectKind::SemaphoreSurface(_)))
            .map(|(&h, _)| h)
            .collect();
        for h in surfaces {
            self.sweep_surface(st, h);
        }
    }

    fn class_list(&self) -> Vec<u32> {
        let mut classes = vec![
            class::NV01_ROOT_CLIENT,
            class::NV01_CONTEXT_DMA,
            class::NV01_MEMORY_SYSTEM,
            class::NV01_MEMORY_LOCAL_USER,
            class::NV01_DEVICE_0,
            class::NV_SEMAPHORE_SURFACE,
            class::NV20_SUBDEVICE_0,
            class::NV50_MEMORY_VIRTUAL,
            class::FERMI_VASPACE_A,
            class::FERMI_TWOD_A,
            class::KEPLER_INLINE_TO_MEMORY_B,
        ];
        // Newer GPUs keep exposing the classes of older generations.
        for arch in GpuArch::ALL.iter().filter(|&&a| a <= self.config.arch) {
            let t = arch.table();
            classes.extend([t.channel, t.threed, t.compute, t.copy]);
            classes.extend(t.usermode);
        }
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    fn pci_device_id(&self) -> u16 {
        match self.config.arch {
            GpuArch::Pascal => 0x1B80,
            GpuArch::Volta => 0x1DB4,
            GpuArch::Turing => 0x1E87,
            GpuArch::Ampere => 0x2204,
            GpuArch::Ada => 0x2684,
            GpuArch::Hopper => 0x2330,
        }
    }

    // ── Escapes ──────────────────────────────────────────────────────────

    fn escape_alloc(&self, st: &mut SimState, buf: &mut [u8], fail: bool) -> Result<(), Errno> {
        let mut header = AllocHeader::from_bytes(buf).map_err(|_| Errno::EFAULT)?;
        let (head, rest) = buf.split_at_mut(AllocHeader::SIZE);
        let body = rest
            .get_mut(..header.params_size as usize)
            .ok_or(Errno::EFAULT)?;
        let result = if fail {
            Err(status::NV_ERR_GENERIC)
        } else {
            self.alloc_object(st, &header, body)
        };
        match result {
            Ok(handle) => {
                header.h_object_new = handle;
                header.status = status::NV_OK.raw();
            }
            Err(s) => {
                debug!(
                    "sim-rm: alloc class 0x{:04X} under 0x{:08X} failed: {s}",
                    header.h_class, header.h_object_parent
                );
                header.status = s.raw();
            }
        }
        head.copy_from_slice(&header.to_bytes());
        Ok(())
    }

    fn alloc_object(
        &self,
        st: &mut SimState,
        header: &AllocHeader,
        body: &mut [u8],
    ) -> Result<Handle, NvStatus> {
        if header.h_class == class::NV01_ROOT_CLIENT {
            let handle = st
                .objects
                .add(NULL_HANDLE, NULL_HANDLE, header.h_class, ObjectKind::Client)?;
            debug!("sim-rm: client 0x{handle:08X}");
            return Ok(handle);
        }
        let client = header.h_root;
        if st.objects.get(header.h_object_parent)?.client != client {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }
        let kind = self.build_object(st, header.h_object_parent, header.h_class, body)?;
        let name = kind.name();
        let handle = st
            .objects
            .add(client, header.h_object_parent, header.h_class, kind)?;
        trace!(
            "sim-rm: {name} 0x{handle:08X} class 0x{:04X} under 0x{:08X}",
            header.h_class,
            header.h_object_parent
        );
        Ok(handle)
    }

    fn build_object(
        &self,
        st: &mut SimState,
        parent: Handle,
        class_id: u32,
        body: &mut [u8],
    ) -> Result<ObjectKind, NvStatus> {
        let table = self.table();
        let parent_kind = &st.objects.get(parent)?.kind;
        let under_device = matches!(parent_kind, ObjectKind::Device { .. });
        let engines = [
            table.threed,
            table.compute,
            table.copy,
            table.twod,
            table.inline_to_memory,
        ];

        match class_id {
            class::NV01_DEVICE_0 => {
                expect_parent(matches!(parent_kind, ObjectKind::Client))?;
                let p: DeviceAllocParams = decode(body)?;
                if p.device_id >= self.config.cards {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                if st.faults.mismatched_devices.contains(&p.device_id) {
                    return Err(status::NV_ERR_LIB_RM_VERSION_MISMATCH);
                }
                Ok(ObjectKind::Device {
                    device_id: p.device_id,
                })
            }
            class::NV20_SUBDEVICE_0 => {
                expect_parent(under_device)?;
                let _: SubdeviceAllocParams = decode(body)?;
                Ok(ObjectKind::Subdevice)
            }
            class::FERMI_VASPACE_A => {
                expect_parent(under_device)?;
                let _: VaSpaceAllocParams = decode(body)?;
                Ok(ObjectKind::VaSpace)
            }
            class::NV01_MEMORY_SYSTEM | class::NV01_MEMORY_LOCAL_USER => {
                expect_parent(under_device)?;
                let mut p: MemoryAllocParams = decode(body)?;
                if p.size == 0 || p.size > MAX_ALLOCATION {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                let size = align_up(p.size, PAGE_SIZE);
                let backing = CpuMapping::anonymous(size as usize, 0)
                    .map_err(|_| status::NV_ERR_NO_MEMORY)?;
                p.size = size;
                p.offset = 0;
                encode(body, &p)?;
                Ok(ObjectKind::Memory(MemoryObject {
                    backing: Arc::new(backing),
                    size,
                    system: class_id == class::NV01_MEMORY_SYSTEM,
                    kind: p.format,
                    dma_mappings: 0,
                    cpu_mappings: 0,
                }))
            }
            class::NV50_MEMORY_VIRTUAL => {
                expect_parent(under_device)?;
                let mut p: MemoryAllocParams = decode(body)?;
                let h_va_space = p.h_va_space;
                if !matches!(st.objects.get(h_va_space)?.kind, ObjectKind::VaSpace) {
                    return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
                }
                let align = p.alignment.max(PAGE_SIZE);
                if p.size == 0 || !align.is_power_of_two() {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                let size = align_up(p.size, PAGE_SIZE);
                let fixed = p.flags & memory_flags::FIXED_ADDRESS_ALLOCATE != 0;
                let base = if fixed {
                    p.offset
                } else {
                    align_up(st.next_auto_va, align)
                };
                let in_range = base.checked_add(size).is_some_and(|end| end <= GPU_VA_SIZE);
                if !is_aligned(base, align) || !in_range {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                let overlaps = st.objects.iter().any(|(_, o)| match &o.kind {
                    ObjectKind::Virtual(v) => {
                        v.h_va_space == h_va_space && base < v.base + v.size && v.base < base + size
                    }
                    _ => false,
                });
                if overlaps {
                    return Err(status::NV_ERR_STATE_IN_USE);
                }
                if !fixed {
                    st.next_auto_va = base + size;
                }
                let kind = st.faults.kind_override.unwrap_or(p.format);
                p.format = kind;
                p.offset = base;
                p.size = size;
                p.limit = base + size - 1;
                encode(body, &p)?;
                Ok(ObjectKind::Virtual(VirtualObject {
                    h_va_space,
                    base,
                    size,
                    kind,
                    mappings: BTreeMap::new(),
                }))
            }
            class::NV01_CONTEXT_DMA => {
                expect_parent(under_device)?;
                let p: ContextDmaAllocParams = decode(body)?;
                st.objects.memory(p.h_memory)?;
                Ok(ObjectKind::ContextDma {
                    h_memory: p.h_memory,
                })
            }
            class::NV_SEMAPHORE_SURFACE => {
                expect_parent(matches!(parent_kind, ObjectKind::Subdevice))?;
                let p: SemaphoreSurfaceAllocParams = decode(body)?;
                st.objects.memory(p.h_semaphore_mem)?;
                st.objects.memory(p.h_max_submitted_mem)?;
                Ok(ObjectKind::SemaphoreSurface(SurfaceObject {
                    h_semaphore_mem: p.h_semaphore_mem,
                    h_max_submitted_mem: p.h_max_submitted_mem,
                    channels: Vec::new(),
                    waiters: Vec::new(),
                }))
            }
            c if table.usermode == Some(c) => {
                expect_parent(matches!(parent_kind, ObjectKind::Subdevice))?;
                let page = CpuMapping::anonymous(USERMODE_MAP_SIZE as usize, 0)
                    .map_err(|_| status::NV_ERR_NO_MEMORY)?;
                Ok(ObjectKind::Usermode {
                    page: Arc::new(page),
                })
            }
            c if c == table.channel => {
                expect_parent(under_device)?;
                let p: ChannelAllocParams = decode(body)?;
                if !matches!(
                    st.objects.get(p.h_object_error)?.kind,
                    ObjectKind::ContextDma { .. }
                ) || !matches!(st.objects.get(p.h_va_space)?.kind, ObjectKind::VaSpace)
                {
                    return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
                }
                let userd_mem = st.objects.memory(p.h_userd_memory)?;
                let userd_fits = p
                    .userd_offset
                    .checked_add(userd::SIZE)
                    .is_some_and(|end| end <= userd_mem.size);
                if !userd_fits || !is_aligned(p.userd_offset, 8) {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                if p.engine_type != engine_type::GRAPHICS && p.engine_type != engine_type::COPY0 {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                let userd = userd_mem.backing.clone();
                let ring_bytes = p.gp_fifo_entries as u64 * 8;
                if p.gp_fifo_entries == 0
                    || !st.mmu.is_mapped(p.gp_fifo_offset)
                    || !st.mmu.is_mapped(p.gp_fifo_offset + ring_bytes - 1)
                {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                let token = st.next_token;
                st.next_token += 1;
                Ok(ObjectKind::Channel(Box::new(ChannelObject {
                    token,
                    engine_type: p.engine_type,
                    gpfifo_va: p.gp_fifo_offset,
                    entries: p.gp_fifo_entries,
                    userd,
                    userd_offset: p.userd_offset as usize,
                    scheduled: false,
                    doorbell_pending: false,
                    subchannels: [0; 8],
                    host: HostLatch::default(),
                })))
            }
            c if engines.contains(&c) => {
                let ObjectKind::Channel(channel) = parent_kind else {
                    return Err(status::NV_ERR_INVALID_OBJECT_PARENT);
                };
                if channel.engine_type == engine_type::COPY0 && c != table.copy {
                    return Err(status::NV_ERR_INVALID_CLASS);
                }
                Ok(ObjectKind::Engine)
            }
            _ => Err(status::NV_ERR_INVALID_CLASS),
        }
    }

    fn free_object(&self, st: &mut SimState, client: Handle, handle: Handle) -> Result<(), NvStatus> {
        if handle == NULL_HANDLE {
            return Ok(());
        }
        let obj = match st.objects.get(handle) {
            Ok(obj) => obj,
            Err(e) => {
                if st.objects.was_freed(handle) {
                    st.stats.double_frees += 1;
                    warn!("sim-rm: double free of 0x{handle:08X}");
                }
                return Err(e);
            }
        };
        if obj.client != client {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }
        let name = obj.kind.name();
        if let Some(reason) = busy_reason(st, handle) {
            st.stats.teardown_violations += 1;
            warn!("sim-rm: {name} 0x{handle:08X} freed while {reason}");
        }

        let removed = st.objects.remove_tree(handle)?;
        if removed.len() > 1 {
            st.stats.teardown_violations += 1;
            warn!(
                "sim-rm: {name} 0x{handle:08X} freed with {} live descendant(s)",
                removed.len() - 1
            );
        }
        for (h, obj) in removed {
            release_object(st, h, obj.kind);
        }
        trace!("sim-rm: freed {name} 0x{handle:08X}");
        Ok(())
    }

    fn escape_control(&self, st: &mut SimState, buf: &mut [u8], fail: bool) -> Result<(), Errno> {
        let mut header = ControlHeader::from_bytes(buf).map_err(|_| Errno::EFAULT)?;
        let (head, rest) = buf.split_at_mut(ControlHeader::SIZE);
        let body = rest
            .get_mut(..header.params_size as usize)
            .ok_or(Errno::EFAULT)?;
        let result = if fail {
            Err(status::NV_ERR_GENERIC)
        } else {
            self.control(st, &header, body)
        };
        header.status = reply(result);
        head.copy_from_slice(&header.to_bytes());
        Ok(())
    }

    fn control(&self, st: &mut SimState, header: &ControlHeader, body: &mut [u8]) -> Result<(), NvStatus> {
        let h = header.h_object;
        let obj = st.objects.get(h)?;
        if obj.client != header.h_client {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }
        match header.cmd {
            ctrl::DEVICE_GET_CLASSLIST_V2 => {
                if !matches!(obj.kind, ObjectKind::Device { .. }) {
                    return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
                }
                let classes = self.class_list();
                let mut p = ClassListParams::default();
                let n = classes.len().min(CLASSLIST_MAX_SIZE);
                p.class_list[..n].copy_from_slice(&classes[..n]);
                p.num_classes = n as u32;
                encode(body, &p)
            }
            ctrl::FB_GET_SEMAPHORE_SURFACE_LAYOUT => {
                if !matches!(obj.kind, ObjectKind::Subdevice) {
                    return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
                }
                let p = SemaphoreSurfaceLayoutParams {
                    caps: if self.wide_semaphores() {
                        SEMAPHORE_SURFACE_CAPS_64BIT_SUPPORTED
                    } else {
                        0
                    },
                    size: SEMAPHORE_STRIDE as u32,
                    max_submitted_semaphore_value_offset: MAX_SUBMITTED_OFFSET as u32,
                    monitored_fence_threshold_offset: 0,
                };
                encode(body, &p)
            }
            ctrl::GPFIFO_SCHEDULE => {
                let p: GpfifoScheduleParams = decode(body)?;
                let channel = st.objects.channel_mut(h)?;
                channel.scheduled = p.enable != 0;
                debug!(
                    "sim-rm: channel 0x{h:08X} scheduling {}",
                    if channel.scheduled { "enabled" } else { "disabled" }
                );
                Ok(())
            }
            ctrl::GET_WORK_SUBMIT_TOKEN => {
                if self.table().usermode.is_none() {
                    return Err(status::NV_ERR_NOT_SUPPORTED);
                }
                let token = st.objects.channel_mut(h)?.token;
                encode(body, &WorkSubmitTokenParams { work_submit_token: token })
            }
            ctrl::SEMSURF_BIND_CHANNEL => {
                let p: SemSurfChannelParams = decode(body)?;
                if p.num_notify_indices as usize > SEMSURF_MAX_NOTIFY_INDICES {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                st.objects.channel_mut(p.h_channel)?;
                let surface = st.objects.surface_mut(h)?;
                if surface.channels.iter().any(|(c, _)| *c == p.h_channel) {
                    return Err(status::NV_ERR_STATE_IN_USE);
                }
                surface.channels.push((p.h_channel, p.indices().to_vec()));
                Ok(())
            }
            ctrl::SEMSURF_UNBIND_CHANNEL => {
                let p: SemSurfChannelParams = decode(body)?;
                let surface = st.objects.surface_mut(h)?;
                let pos = surface
                    .channels
                    .iter()
                    .position(|(c, _)| *c == p.h_channel)
                    .ok_or(status::NV_ERR_INVALID_STATE)?;
                surface.channels.remove(pos);
                Ok(())
            }
            ctrl::SEMSURF_REGISTER_WAITER => {
                let p: SemSurfRegisterWaiterParams = decode(body)?;
                let (_, slots) = Self::surface_backing(&st.objects, h)?;
                if p.index >= slots {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                let fd = i32::try_from(p.notification_handle)
                    .map_err(|_| status::NV_ERR_INVALID_ARGUMENT)?;
                match st.events.get(&fd) {
                    Some(event) if event.client == header.h_client => {}
                    _ => return Err(status::NV_ERR_INVALID_ARGUMENT),
                }
                st.objects.surface_mut(h)?.waiters.push(Waiter {
                    index: p.index,
                    wait_value: p.wait_value,
                    new_value: p.new_value,
                    fd,
                });
                self.sweep_surface(st, h);
                Ok(())
            }
            ctrl::SEMSURF_UNREGISTER_WAITER => {
                let p: SemSurfUnregisterWaiterParams = decode(body)?;
                let surface = st.objects.surface_mut(h)?;
                let pos = surface
                    .waiters
                    .iter()
                    .position(|w| {
                        w.index == p.index
                            && w.wait_value == p.wait_value
                            && w.fd as u64 == p.notification_handle
                    })
                    .ok_or(status::NV_ERR_OBJECT_NOT_FOUND)?;
                surface.waiters.remove(pos);
                Ok(())
            }
            ctrl::SEMSURF_SET_VALUE => {
                let p: SemSurfSetValueParams = decode(body)?;
                let (backing, slots) = Self::surface_backing(&st.objects, h)?;
                if p.index >= slots {
                    return Err(status::NV_ERR_INVALID_ARGUMENT);
                }
                self.write_slot(&backing, p.index, p.new_value);
                backing
                    .atomic_u64((p.index * SEMAPHORE_STRIDE + MAX_SUBMITTED_OFFSET) as usize)
                    .store(p.new_value, Ordering::Release);
                self.sweep_surface(st, h);
                Ok(())
            }
            cmd => {
                debug!("sim-rm: unsupported control 0x{cmd:08X} on 0x{h:08X}");
                Err(status::NV_ERR_NOT_SUPPORTED)
            }
        }
    }

    fn map_memory(&self, st: &mut SimState, p: &mut MapMemoryParams) -> Result<(), NvStatus> {
        let obj = st.objects.get(p.h_memory)?;
        if obj.client != p.h_client {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }
        let (backing, size) = match &obj.kind {
            ObjectKind::Memory(m) => (m.backing.clone(), m.size),
            ObjectKind::Usermode { page } => (page.clone(), USERMODE_MAP_SIZE),
            _ => return Err(status::NV_ERR_INVALID_OBJECT_HANDLE),
        };
        let fits = p.offset.checked_add(p.length).is_some_and(|end| end <= size);
        if p.length == 0 || !is_aligned(p.offset, 8) || !fits {
            return Err(status::NV_ERR_INVALID_ARGUMENT);
        }
        let linear = st.next_linear;
        st.next_linear += align_up(p.length, PAGE_SIZE);
        st.cpu_maps.insert(
            linear,
            CpuMapRecord {
                h_memory: p.h_memory,
                backing,
                offset: p.offset as usize,
                length: p.length,
            },
        );
        if let Ok(m) = st.objects.memory_mut(p.h_memory) {
            m.cpu_mappings += 1;
        }
        p.linear_address = linear;
        Ok(())
    }

    fn unmap_memory(&self, st: &mut SimState, p: &UnmapMemoryParams) -> Result<(), NvStatus> {
        match st.cpu_maps.get(&p.linear_address) {
            Some(r) if r.h_memory == p.h_memory => {}
            _ => return Err(status::NV_ERR_INVALID_ARGUMENT),
        }
        st.cpu_maps.remove(&p.linear_address);
        if let Ok(m) = st.objects.memory_mut(p.h_memory) {
            m.cpu_mappings = m.cpu_mappings.saturating_sub(1);
        }
        Ok(())
    }

    fn map_memory_dma(&self, st: &mut SimState, p: &mut MapMemoryDmaParams) -> Result<(), NvStatus> {
        let memory = st.objects.memory(p.h_memory)?;
        let (backing, mem_size) = (memory.backing.clone(), memory.size);
        let fits = p.offset.checked_add(p.length).is_some_and(|end| end <= mem_size);
        if p.length == 0 || !is_aligned(p.offset, PAGE_SIZE) || !fits {
            return Err(status::NV_ERR_INVALID_ARGUMENT);
        }
        let length = align_up(p.length, PAGE_SIZE);

        let virt = st.objects.virtual_mut(p.h_dma)?;
        let va = if p.flags & dma_flags::DMA_OFFSET_FIXED != 0 {
            p.dma_offset
        } else {
            virt.base
        };
        if !is_aligned(va, PAGE_SIZE) || !virt.contains(va, length) {
            return Err(status::NV_ERR_INVALID_ARGUMENT);
        }
        if virt.overlaps_mapping(va, length) {
            return Err(status::NV_ERR_STATE_IN_USE);
        }
        virt.mappings.insert(
            va,
            DmaMapping {
                h_memory: p.h_memory,
                length,
            },
        );
        st.mmu.map(va, &backing, p.offset as usize, length);
        if let Ok(m) = st.objects.memory_mut(p.h_memory) {
            m.dma_mappings += 1;
        }
        p.dma_offset = va;
        Ok(())
    }

    fn unmap_memory_dma(&self, st: &mut SimState, p: &UnmapMemoryDmaParams) -> Result<(), NvStatus> {
        let virt = st.objects.virtual_mut(p.h_dma)?;
        let mapping = match virt.mappings.get(&p.dma_offset) {
            Some(m) if m.h_memory == p.h_memory => *m,
            _ => return Err(status::NV_ERR_INVALID_ARGUMENT),
        };
        virt.mappings.remove(&p.dma_offset);
        st.mmu.unmap(p.dma_offset, mapping.length);
        if let Ok(m) = st.objects.memory_mut(p.h_memory) {
            m.dma_mappings = m.dma_mappings.saturating_sub(1);
        }
        Ok(())
    }

    fn os_event(&self, st: &mut SimState, p: &OsEventParams, attach: bool) -> Result<(), NvStatus> {
        if !matches!(st.objects.get(p.h_client)?.kind, ObjectKind::Client) {
            return Err(status::NV_ERR_INVALID_OBJECT_HANDLE);
        }
        let event = st
            .events
            .get_mut(&p.fd)
            .ok_or(status::NV_ERR_INVALID_ARGUMENT)?;
        if attach {
            if event.client != NULL_HANDLE {
                return Err(status::NV_ERR_STATE_IN_USE);
            }
            event.client = p.h_client;
        } else {
            if event.client != p.h_client {
                return Err(status::NV_ERR_INVALID_ARGUMENT);
            }
            event.client = NULL_HANDLE;
            drop_waiters(&mut st.objects, p.fd);
        }
        Ok(())
    }

    fn card_info(&self, buf: &mut [u8]) -> Result<(), Errno> {
        if buf.len() < CardInfo::SIZE * MAX_CARDS {
            return Err(Errno::EINVAL);
        }
        for (i, chunk) in buf.chunks_exact_mut(CardInfo::SIZE).take(MAX_CARDS).enumerate() {
            let record = if (i as u32) < self.config.cards {
                CardInfo {
                    valid: 1,
                    gpu_id: 0x100 * (i as u32 + 1),
                    minor_number: i as u32,
                    domain: 0,
                    bus: i as u8 + 1,
                    vendor_id: NVIDIA_VENDOR_ID,
                    device_id: self.pci_device_id(),
                    ..Default::default()
                }
            } else {
                CardInfo::default()
            };
            chunk.copy_from_slice(&record.to_bytes());
        }
        Ok(())
    }
}

impl RmTransport for SoftRm {
    fn name(&self) -> &str {
        "soft-rm"
    }

    fn ioctl(&self, escape: Escape, params: &mut [u8]) -> Result<(), Errno> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        *st.stats.calls.entry(escape).or_default() += 1;
        if st.faults.eintr > 0 {
            st.faults.eintr -= 1;
            st.stats.injected_interrupts += 1;
            trace!("sim-rm: {escape:?} interrupted");
            return Err(Errno::EINTR);
        }
        let injectable = matches!(
            escape,
            Escape::RmAlloc
                | Escape::RmControl
                | Escape::RmMapMemory
                | Escape::RmMapMemoryDma
                | Escape::AllocOsEvent
        );
        let fail = injectable && st.faults.take_failure();
        if fail {
            st.stats.injected_failures += 1;
            debug!("sim-rm: failing {escape:?} on request");
        }

        match escape {
            Escape::RmAlloc => self.escape_alloc(st, params, fail),
            Escape::RmControl => self.escape_control(st, params, fail),
            Escape::RmFree => with_block(params, |p: &mut FreeParams| {
                p.status = reply(self.free_object(st, p.h_root, p.h_object_old));
            }),
            Escape::RmMapMemory => with_block(params, |p: &mut MapMemoryParams| {
                p.status = reply(if fail {
                    Err(status::NV_ERR_GENERIC)
                } else {
                    self.map_memory(st, p)
                });
            }),
            Escape::RmUnmapMemory => with_block(params, |p: &mut UnmapMemoryParams| {
                p.status = reply(self.unmap_memory(st, p));
            }),
            Escape::RmMapMemoryDma => with_block(params, |p: &mut MapMemoryDmaParams| {
                p.status = reply(if fail {
                    Err(status::NV_ERR_GENERIC)
                } else {
                    self.map_memory_dma(st, p)
                });
            }),
            Escape::RmUnmapMemoryDma => with_block(params, |p: &mut UnmapMemoryDmaParams| {
                p.status = reply(self.unmap_memory_dma(st, p));
            }),
            Escape::AllocOsEvent => with_block(params, |p: &mut OsEventParams| {
                p.status = reply(if fail {
                    Err(status::NV_ERR_GENERIC)
                } else {
                    self.os_event(st, p, true)
                });
            }),
            Escape::FreeOsEvent => with_block(params, |p: &mut OsEventParams| {
                p.status = reply(self.os_event(st, p, false));
            }),
            Escape::CardInfo => self.card_info(params),
            Escape::CheckVersionStr => with_block(params, |p: &mut CheckVersionParams| {
                let recognized =
                    !st.faults.reject_version && p.version() == self.config.driver_version;
                p.reply = if recognized {
                    CHECK_VERSION_REPLY_RECOGNIZED
                } else {
                    CHECK_VERSION_REPLY_UNRECOGNIZED
                };
            }),
        }
    }

    fn mmap(&self, linear_address: u64, length: u64) -> io::Result<CpuMapping> {
        let st = self.state.lock();
        let record = st.cpu_maps.get(&linear_address).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no mapping at linear address 0x{linear_address:X}"),
            )
        })?;
        if record.length != length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "mapping length mismatch: 0x{length:X} != 0x{:X}",
                    record.length
                ),
            ));
        }
        let backing = record.backing.clone();
        let ptr = NonNull::new(backing.as_ptr().wrapping_add(record.offset))
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null backing"))?;
        // SAFETY: offset + length was checked against the backing size at map
        // time, the offset is 8-byte aligned, and the Arc handed over as owner
        // keeps the pages alive.
        Ok(unsafe { CpuMapping::from_raw_parts(ptr, length as usize, linear_address, Box::new(backing)) })
    }

    fn open_event(&self) -> io::Result<EventFd> {
        let mut st = self.state.lock();
        let fd = st.next_fd;
        st.next_fd += 1;
        st.events.insert(
            fd,
            EventState {
                client: NULL_HANDLE,
                signaled: false,
            },
        );
        trace!("sim-rm: opened event fd={fd}");
        Ok(EventFd(fd))
    }

    fn close_event(&self, fd: EventFd) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match st.events.remove(&fd.0) {
            Some(event) if event.client != NULL_HANDLE => {
                st.stats.teardown_violations += 1;
                warn!("sim-rm: event fd={} closed while attached", fd.0);
                drop_waiters(&mut st.objects, fd.0);
            }
            Some(_) => {}
            None => warn!("sim-rm: close of unknown event fd={}", fd.0),
        }
    }

    fn poll_event(&self, fd: EventFd, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        if !st.events.contains_key(&fd.0) {
            return Err(unknown_event(fd));
        }
        if st.faults.spurious_wakeups > 0 {
            st.faults.spurious_wakeups -= 1;
            st.stats.spurious_wakeups += 1;
            return Ok(true);
        }
        loop {
            self.run_gpu_locked(&mut st);
            let event = st.events.get_mut(&fd.0).ok_or_else(|| unknown_event(fd))?;
            if event.signaled {
                event.signaled = false;
                return Ok(true);
            }
            if self.wake.wait_until(&mut st, deadline).timed_out() {
                let event = st.events.get_mut(&fd.0).ok_or_else(|| unknown_event(fd))?;
                return Ok(std::mem::take(&mut event.signaled));
            }
        }
    }
}

impl std::fmt::Debug for SoftRm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftRm").field("config", &self.config).finish()
    }
}

fn unknown_event(fd: EventFd) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("unknown event fd={}", fd.0))
}

fn expect_parent(ok: bool) -> Result<(), NvStatus> {
    if ok {
        Ok(())
    } else {
        Err(status::NV_ERR_INVALID_OBJECT_PARENT)
    }
}

fn reply(result: Result<(), NvStatus>) -> u32 {
    match result {
        Ok(()) => status::NV_OK.raw(),
        Err(s) => s.raw(),
    }
}

fn decode<P: Wire>(body: &[u8]) -> Result<P, NvStatus> {
    P::from_bytes(body).map_err(|_| status::NV_ERR_INVALID_ARGUMENT)
}

fn encode<P: Wire>(body: &mut [u8], params: &P) -> Result<(), NvStatus> {
    let bytes = params.to_bytes();
    body.get_mut(..bytes.len())
        .ok_or(status::NV_ERR_INVALID_ARGUMENT)?
        .copy_from_slice(&bytes);
    Ok(())
}

/// Decode a fixed block, let `f` update it and write it back in place.
fn with_block<P: Wire>(buf: &mut [u8], f: impl FnOnce(&mut P)) -> Result<(), Errno> {
    let mut params = P::from_bytes(buf).map_err(|_| Errno::EFAULT)?;
    f(&mut params);
    buf[..P::SIZE].copy_from_slice(&params.to_bytes());
    Ok(())
}

/// Why `handle` should not be freed yet, if anything.
fn busy_reason(st: &SimState, handle: Handle) -> Option<&'static str> {
    match &st.objects.get(handle).ok()?.kind {
        ObjectKind::Memory(m) if m.dma_mappings > 0 => Some("mapped into a virtual range"),
        ObjectKind::Memory(m) if m.cpu_mappings > 0 => Some("CPU mapped"),
        ObjectKind::Usermode { .. } if st.cpu_maps.values().any(|r| r.h_memory == handle) => {
            Some("CPU mapped")
        }
        ObjectKind::Virtual(v) if !v.mappings.is_empty() => Some("still bound"),
        ObjectKind::SemaphoreSurface(s) if !s.channels.is_empty() => Some("channels are bound"),
        ObjectKind::Channel(_) => st
            .objects
            .iter()
            .any(|(_, o)| match &o.kind {
                ObjectKind::SemaphoreSurface(s) => s.channels.iter().any(|(c, _)| *c == handle),
                _ => false,
            })
            .then_some("bound to a semaphore surface"),
        ObjectKind::Client if st.events.values().any(|e| e.client == handle) => {
            Some("os events are attached")
        }
        _ => None,
    }
}

/// Drop whatever state outside the object table refers to a freed object.
fn release_object(st: &mut SimState, handle: Handle, kind: ObjectKind) {
    match kind {
        ObjectKind::Virtual(v) => {
            for (va, m) in v.mappings {
                st.mmu.unmap(va, m.length);
                if let Ok(mem) = st.objects.memory_mut(m.h_memory) {
                    mem.dma_mappings = mem.dma_mappings.saturating_sub(1);
                }
            }
        }
        ObjectKind::Memory(_) => {
            st.cpu_maps.retain(|_, r| r.h_memory != handle);
            let mut stale = Vec::new();
            for (_, o) in st.objects.iter_mut() {
                if let ObjectKind::Virtual(v) = &mut o.kind {
                    v.mappings.retain(|&va, m| {
                        let keep = m.h_memory != handle;
                        if !keep {
                            stale.push((va, m.length));
                        }
                        keep
                    });
                }
            }
            for (va, length) in stale {
                st.mmu.unmap(va, length);
            }
        }
        ObjectKind::Usermode { .. } => st.cpu_maps.retain(|_, r| r.h_memory != handle),
        ObjectKind::Channel(_) => {
            for (_, o) in st.objects.iter_mut() {
                if let ObjectKind::SemaphoreSurface(s) = &mut o.kind {
                    s.channels.retain(|(c, _)| *c != handle);
                }
            }
        }
        ObjectKind::Client => {
            for event in st.events.values_mut().filter(|e| e.client == handle) {
                event.client = NULL_HANDLE;
            }
        }
        _ => {}
    }
}

fn drop_waiters(objects: &mut ObjectTable, fd: i32) {
    for (_, o) in objects.iter_mut() {
        if let ObjectKind::SemaphoreSurface(s) = &mut o.kind {
            s.waiters.retain(|w| w.fd != fd);
        }
    }
}
