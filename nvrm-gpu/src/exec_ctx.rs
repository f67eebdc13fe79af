// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Execution contexts: one GPFIFO channel with its ring, USERD page, scratch
//! command buffer and completion semaphore.
//!
//! Work is buffered with [`ExecContext::exec`] / [`ExecContext::push`] and
//! submitted by [`ExecContext::flush`], which appends a semaphore release
//! carrying the next sequence number, publishes GP_PUT, rings the doorbell
//! and blocks until the GPU has written that number back.

use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace, warn};

use nvrm_client::params::{
    ctrl, ChannelAllocParams, ContextDmaAllocParams, GpfifoScheduleParams, NoParams,
    WorkSubmitTokenParams,
};
use nvrm_client::{OsEvent, RmObject};
use nvrm_common::classes::{class, engine_type};
use nvrm_common::{GpuVa, Handle, MemoryLocation, SubChannel, PAGE_SIZE};

use crate::device::Device;
use crate::error::{GpuError, GpuResult};
use crate::gpfifo::{GpfifoEntry, GpfifoRing, GP_ENTRY_SIZE};
use crate::memory::GpuBuffer;
use crate::pushbuf::CommandStream;
use crate::semaphore::SemaphoreSurface;
use crate::sync::TimelineSync;

/// Completion slot in the context's semaphore surface.
const COMPLETION_SLOT: u64 = 0;

/// USERD lives at the start of its page.
const USERD_OFFSET: usize = 0;

/// Scratch words kept free for the completion release: wait-for-idle,
/// a five-word semaphore method and the non-stall interrupt.
const RELEASE_WORDS: usize = 2 + 6 + 2;

bitflags! {
    /// Engines a context binds to subchannels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Engines: u32 {
        const COPY = 1 << 0;
        const TWOD = 1 << 1;
        const THREED = 1 << 2;
        const M2MF = 1 << 3;
        const COMPUTE = 1 << 4;
    }
}

impl Engines {
    /// Subchannels of the selected engines, in allocation order.
    pub fn subchannels(self) -> impl Iterator<Item = SubChannel> {
        [
            (Self::COPY, SubChannel::Copy),
            (Self::TWOD, SubChannel::Twod),
            (Self::THREED, SubChannel::Threed),
            (Self::M2MF, SubChannel::InlineToMemory),
            (Self::COMPUTE, SubChannel::Compute),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, subc)| subc)
    }

    /// Runlist engine for a channel carrying these engines. Channels with
    /// nothing but the copy engine run on the copy runlist.
    pub fn engine_type(self) -> u32 {
        if self == Self::COPY {
            engine_type::COPY0
        } else {
            engine_type::GRAPHICS
        }
    }
}

/// Lifecycle of an [`ExecContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Ready,
    Submitting,
    WaitingForCompletion,
    Destroying,
}

/// A caller-owned command segment to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushEntry {
    pub address: GpuVa,
    /// Length in bytes; a multiple of 4.
    pub length: u64,
    pub no_prefetch: bool,
}

/// A timeline value to wait for or signal.
#[derive(Debug, Clone, Copy)]
pub struct SyncPoint<'a> {
    pub timeline: &'a TimelineSync,
    pub value: u64,
}

pub struct ExecContext {
    // Fields drop in reverse creation order; Drop unbinds the surface first.
    surface: SemaphoreSurface,
    event: OsEvent,
    _engines: Vec<RmObject>,
    channel: RmObject,
    _error_ctx_dma: RmObject,
    cmd_buf: GpuBuffer,
    gpfifo: GpuBuffer,
    userd: GpuBuffer,
    _notifier: GpuBuffer,
    device: Arc<Device>,

    engine_mask: Engines,
    ring: GpfifoRing,
    /// Words of `cmd_buf` in use since the last completed flush.
    cmd_cursor: usize,
    sequence: u64,
    token: Option<u32>,
    state: ContextState,
}

impl ExecContext {
    /// Build a channel with `engines` bound. Every step that fails releases
    /// what the earlier steps created, newest first.
    pub fn create(device: &Arc<Device>, engines: Engines) -> GpuResult<Self> {
        let settings = device.settings();
        let arch = device.arch();
        let rm = device.rm();
        if settings.ring_entries < 2 {
            return Err(GpuError::InvalidArgument("ring needs at least two entries"));
        }
        if settings.command_buffer_size / 4 <= RELEASE_WORDS as u64 {
            return Err(GpuError::InvalidArgument("command buffer too small"));
        }

        let notifier = GpuBuffer::alloc(device, PAGE_SIZE, MemoryLocation::System)?;
        let userd = GpuBuffer::alloc(device, PAGE_SIZE, MemoryLocation::System)?;
        let gpfifo = GpuBuffer::alloc(
            device,
            settings.ring_entries as u64 * GP_ENTRY_SIZE,
            MemoryLocation::System,
        )?;
        let cmd_buf = GpuBuffer::alloc(device, settings.command_buffer_size, MemoryLocation::System)?;

        let mut params = ContextDmaAllocParams {
            flags: 0,
            h_memory: notifier.memory().handle(),
            offset: 0,
            limit: notifier.size() - 1,
        };
        let error_ctx_dma = RmObject::alloc(rm, device.handle(), class::NV01_CONTEXT_DMA, &mut params)?;

        let mut params = ChannelAllocParams {
            h_object_error: error_ctx_dma.handle(),
            gp_fifo_offset: gpfifo.gpu_va(),
            gp_fifo_entries: settings.ring_entries,
            h_va_space: device.va_space_handle(),
            h_userd_memory: userd.memory().handle(),
            userd_offset: USERD_OFFSET as u64,
            engine_type: engines.engine_type(),
            ..Default::default()
        };
        let channel = RmObject::alloc(rm, device.handle(), arch.channel, &mut params)?;

        let mut schedule = GpfifoScheduleParams {
            enable: 1,
            skip_submit: 0,
        };
        channel.control(ctrl::GPFIFO_SCHEDULE, &mut schedule)?;

        let token = if device.has_doorbell() {
            let mut params = WorkSubmitTokenParams::default();
            channel.control(ctrl::GET_WORK_SUBMIT_TOKEN, &mut params)?;
            Some(params.work_submit_token)
        } else {
            None
        };

        let mut bound = Vec::new();
        for subc in engines.subchannels() {
            let class = arch.subchannel_class(subc);
            bound.push(RmObject::alloc(rm, channel.handle(), class, &mut NoParams)?);
        }

        let event = OsEvent::new(rm, device.handle())?;
        let surface = SemaphoreSurface::create(device, PAGE_SIZE)?;
        surface.bind_channel(channel.handle(), &settings.notify_indices)?;

        debug!(
            "exec: channel 0x{:08X} class 0x{:04X} ring=0x{:X} entries={} token={:?}",
            channel.handle(),
            arch.channel,
            gpfifo.gpu_va(),
            settings.ring_entries,
            token
        );

        Ok(Self {
            surface,
            event,
            _engines: bound,
            channel,
            _error_ctx_dma: error_ctx_dma,
            cmd_buf,
            gpfifo,
            userd,
            _notifier: notifier,
            device: device.clone(),
            engine_mask: engines,
            ring: GpfifoRing::new(settings.ring_entries),
            cmd_cursor: 0,
            sequence: 0,
            token,
            state: ContextState::Ready,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn channel_handle(&self) -> Handle {
        self.channel.handle()
    }

    pub fn engines(&self) -> Engines {
        self.engine_mask
    }

    /// Doorbell token, `None` on generations notified by GP_PUT alone.
    pub fn token(&self) -> Option<u32> {
        self.token
    }

    /// Last sequence number handed to the GPU.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Last sequence number the GPU has completed.
    pub fn completed(&self) -> GpuResult<u64> {
        self.surface.get_value(COMPLETION_SLOT)
    }

    /// Ring producer offset.
    pub fn ring_put(&self) -> u32 {
        self.ring.put()
    }

    /// Entries buffered for the next flush.
    pub fn pending(&self) -> u32 {
        self.ring.pending()
    }

    /// GPU address of the completion semaphore.
    pub fn semaphore_address(&self) -> GpuResult<GpuVa> {
        self.surface.gpu_address(COMPLETION_SLOT)
    }

    fn expect_ready(&self) -> GpuResult<()> {
        match self.state {
            ContextState::Ready => Ok(()),
            state => Err(GpuError::InvalidState(state)),
        }
    }

    /// Scratch words callers may still fill before the next flush.
    fn available_words(&self) -> usize {
        let total = (self.cmd_buf.size() / 4) as usize;
        total.saturating_sub(self.cmd_cursor + RELEASE_WORDS)
    }

    fn new_stream(&self, capacity: usize) -> CommandStream {
        CommandStream::new(
            self.device.arch(),
            self.device.semaphore_layout().supports_64bit,
            capacity,
        )
    }

    /// A stream sized to what is left of the scratch command buffer, less
    /// the room the next flush needs for its completion release.
    pub fn stream(&self) -> CommandStream {
        self.new_stream(self.available_words())
    }

    /// Copy `stream` into the scratch command buffer, which must keep
    /// `reserve` words free afterwards. Returns the segment.
    fn stage(&mut self, stream: &CommandStream, reserve: usize) -> GpuResult<PushEntry> {
        let total = (self.cmd_buf.size() / 4) as usize;
        let capacity = total.saturating_sub(self.cmd_cursor + reserve);
        if stream.len() > capacity {
            return Err(GpuError::CommandBufferFull {
                needed: stream.len(),
                capacity,
            });
        }
        let offset = self.cmd_cursor * 4;
        self.cmd_buf.cpu().write_words(offset, stream.words());
        self.cmd_cursor += stream.len();
        Ok(PushEntry {
            address: self.cmd_buf.gpu_va() + offset as u64,
            length: stream.len() as u64 * 4,
            no_prefetch: false,
        })
    }

    fn append(&mut self, entry: &PushEntry) -> GpuResult<()> {
        if entry.length % 4 != 0 {
            return Err(GpuError::InvalidArgument("segment length must be whole words"));
        }
        let words = u32::try_from(entry.length / 4)
            .map_err(|_| GpuError::InvalidArgument("segment too long"))?;
        self.ring.push(
            self.gpfifo.cpu(),
            &GpfifoEntry {
                address: entry.address,
                words,
                no_prefetch: entry.no_prefetch,
            },
        )?;
        Ok(())
    }

    /// Buffer caller-owned segments for the next flush. Either all entries
    /// are buffered or none; one ring slot is always kept for the flush's
    /// completion release.
    pub fn exec(&mut self, entries: &[PushEntry]) -> GpuResult<()> {
        self.expect_ready()?;
        if entries.len() as u64 + 1 > self.ring.space() as u64 {
            return Err(GpuError::RingFull {
                capacity: self.ring.capacity(),
            });
        }
        for entry in entries {
            let words = entry.length / 4;
            let valid = GpfifoEntry {
                address: entry.address,
                words: u32::try_from(words).unwrap_or(u32::MAX),
                no_prefetch: entry.no_prefetch,
            }
            .validate();
            if entry.length % 4 != 0 || valid.is_err() {
                return Err(GpuError::InvalidArgument("push entry"));
            }
        }
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// Stage `stream` in the scratch command buffer and buffer it for the
    /// next flush.
    pub fn push(&mut self, stream: &CommandStream) -> GpuResult<()> {
        self.expect_ready()?;
        if stream.is_empty() {
            return Ok(());
        }
        if self.ring.space() < 2 {
            return Err(GpuError::RingFull {
                capacity: self.ring.capacity(),
            });
        }
        let entry = self.stage(stream, RELEASE_WORDS)?;
        self.append(&entry)
    }

    /// Bind the context's engine for `subc` to that subchannel.
    pub fn set_object(&mut self, subc: SubChannel) -> GpuResult<()> {
        let bound = self.engine_mask.subchannels().any(|s| s == subc);
        if !bound {
            return Err(GpuError::InvalidArgument("engine not allocated on this context"));
        }
        let mut stream = self.stream();
        stream.set_object(subc)?;
        self.push(&stream)
    }

    /// Make subsequent work wait for each timeline to reach its value.
    pub fn wait(&mut self, syncs: &[SyncPoint<'_>]) -> GpuResult<()> {
        if syncs.is_empty() {
            return Ok(());
        }
        let mut stream = self.stream();
        for sync in syncs {
            stream.semaphore_acquire(sync.timeline.gpu_address()?, sync.value)?;
        }
        // Acquires get a segment of their own: a stalled segment is fetched
        // again from its start.
        self.push(&stream)
    }

    /// Release each timeline to its value once prior work is done, then
    /// flush. Returns the flush's sequence number.
    pub fn signal(&mut self, syncs: &[SyncPoint<'_>]) -> GpuResult<u64> {
        self.expect_ready()?;
        let mut stream = self.stream();
        for sync in syncs {
            stream.semaphore_release(sync.timeline.gpu_address()?, sync.value, true)?;
        }
        self.push(&stream)?;
        for sync in syncs {
            sync.timeline.announce(sync.value)?;
        }
        self.flush()
    }

    /// Flush and wait even if nothing is pending.
    pub fn sync(&mut self) -> GpuResult<u64> {
        self.flush()
    }

    /// Submit everything buffered and wait for the GPU to finish it.
    /// Returns the sequence number that completed.
    ///
    /// If the wait fails the context stays in
    /// [`ContextState::WaitingForCompletion`]; calling `flush` again resumes
    /// waiting for the same sequence number.
    pub fn flush(&mut self) -> GpuResult<u64> {
        match self.state {
            ContextState::Ready => {}
            ContextState::WaitingForCompletion => {
                let seq = self.sequence;
                self.complete(seq)?;
                return Ok(seq);
            }
            state => return Err(GpuError::InvalidState(state)),
        }

        self.state = ContextState::Submitting;
        let seq = match self.submit() {
            Ok(seq) => seq,
            Err(e) => {
                self.state = ContextState::Ready;
                return Err(e);
            }
        };
        self.state = ContextState::WaitingForCompletion;
        self.complete(seq)?;
        Ok(seq)
    }

    /// Encode and buffer the completion release for the next sequence
    /// number, then announce it. Nothing changes if any step fails.
    fn submit(&mut self) -> GpuResult<u64> {
        let seq = self.sequence + 1;
        let cursor = self.cmd_cursor;

        let mut stream = self.new_stream(RELEASE_WORDS);
        stream.semaphore_release(self.surface.gpu_address(COMPLETION_SLOT)?, seq, true)?;
        let entry = self.stage(&stream, 0)?;
        if let Err(e) = self.append(&entry) {
            self.cmd_cursor = cursor;
            return Err(e);
        }
        if let Err(e) = self.announce(seq) {
            self.ring.unpush();
            self.cmd_cursor = cursor;
            return Err(e);
        }
        self.sequence = seq;

        let entries = self.ring.pending();
        self.ring.publish(self.userd.cpu(), USERD_OFFSET);
        if let Some(token) = self.token {
            self.device.ring_doorbell(token);
        }
        debug!(
            "exec: channel 0x{:08X} submitted seq={seq} entries={entries} put={}",
            self.channel.handle(),
            self.ring.put()
        );
        Ok(seq)
    }

    /// Raise the max-submitted shadow and arm the completion waiter. Both
    /// happen before GP_PUT moves.
    fn announce(&self, seq: u64) -> GpuResult<()> {
        self.surface.set_max_submitted(COMPLETION_SLOT, seq)?;
        self.surface.register_waiter(
            COMPLETION_SLOT,
            seq,
            0,
            self.event.notification_handle(),
        )
    }

    fn complete(&mut self, seq: u64) -> GpuResult<()> {
        let timeout = self.device.settings().wait_timeout();
        loop {
            if self.surface.get_value(COMPLETION_SLOT)? >= seq {
                break;
            }
            if !self.event.wait(timeout)? {
                debug!(
                    "exec: channel 0x{:08X} still waiting for seq={seq}",
                    self.channel.handle()
                );
            }
        }
        trace!("exec: seq={seq} complete");
        self.cmd_cursor = 0;
        self.ring.retire();
        self.state = ContextState::Ready;
        Ok(())
    }
}

impl Drop for ExecContext {
    fn drop(&mut self) {
        if self.state == ContextState::WaitingForCompletion {
            warn!(
                "exec: destroying channel 0x{:08X} with seq={} outstanding",
                self.channel.handle(),
                self.sequence
            );
        }
        self.state = ContextState::Destroying;
        let indices = &self.device.settings().notify_indices;
        if let Err(e) = self.surface.unbind_channel(self.channel.handle(), indices) {
            warn!("exec: failed to unbind channel 0x{:08X}: {e}", self.channel.handle());
        }
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("put", &self.ring.put())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{open_sim, open_sim_with};
    use nvrm_client::Escape;
    use nvrm_common::classes::host;
    use nvrm_common::{GpuArch, Settings};
    use nvrm_sim::{SimConfig, SoftRm};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn context(config: SimConfig) -> (Arc<SoftRm>, ExecContext) {
        let (sim, device) = open_sim(config);
        let ctx = ExecContext::create(&device, Engines::all()).unwrap();
        (sim, ctx)
    }

    /// A caller-owned segment holding a wait-for-idle.
    fn noop_segment(ctx: &ExecContext) -> (GpuBuffer, PushEntry) {
        let buffer = GpuBuffer::alloc(ctx.device(), PAGE_SIZE, MemoryLocation::System).unwrap();
        let mut stream = ctx.stream();
        stream.wait_for_idle().unwrap();
        buffer.cpu().write_words(0, stream.words());
        let entry = PushEntry {
            address: buffer.gpu_va(),
            length: stream.len() as u64 * 4,
            no_prefetch: false,
        };
        (buffer, entry)
    }

    #[test]
    fn test_engines_map_to_subchannels() {
        let subcs: Vec<_> = (Engines::THREED | Engines::COPY).subchannels().collect();
        assert_eq!(subcs, vec![SubChannel::Copy, SubChannel::Threed]);
        assert_eq!(Engines::all().subchannels().count(), 5);
    }

    #[test]
    fn test_single_flush_end_to_end() {
        let (sim, mut ctx) = context(SimConfig::default());
        let (_segment, entry) = noop_segment(&ctx);
        let before = sim.stats();

        ctx.exec(&[entry]).unwrap();
        assert_eq!(ctx.pending(), 1);
        assert_eq!(ctx.flush().unwrap(), 1);

        let after = sim.stats();
        assert_eq!(after.gp_entries - before.gp_entries, 2);
        assert_eq!(after.doorbells - before.doorbells, 1);
        assert_eq!(after.semaphore_releases - before.semaphore_releases, 1);
        assert_eq!(after.wfis - before.wfis, 2);
        assert_eq!(after.non_stall_interrupts - before.non_stall_interrupts, 1);
        assert_eq!(ctx.completed().unwrap(), 1);
        assert_eq!(ctx.ring_put(), 2);
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn test_sequence_increments_once_per_flush() {
        let (sim, mut ctx) = context(SimConfig::default());
        for n in 1..=10u64 {
            assert_eq!(ctx.flush().unwrap(), n);
            assert_eq!(ctx.sequence(), n);
            assert!(ctx.completed().unwrap() >= n);
        }
        assert_eq!(sim.stats().doorbells, 10);
        assert_eq!(ctx.ring_put(), 10);
    }

    #[test]
    fn test_ring_put_wraps() {
        let settings = Settings {
            ring_entries: 8,
            ..Settings::default()
        };
        let (_sim, device) = open_sim_with(SimConfig::default(), &settings);
        let mut ctx = ExecContext::create(&device, Engines::COPY).unwrap();
        let (_segment, entry) = noop_segment(&ctx);
        let mut appended = 0u32;
        for _ in 0..7 {
            ctx.exec(&[entry, entry]).unwrap();
            ctx.flush().unwrap();
            appended += 3;
            assert_eq!(ctx.ring_put(), appended % 8);
        }
    }

    #[test]
    fn test_exec_reserves_slot_for_release() {
        let settings = Settings {
            ring_entries: 4,
            ..Settings::default()
        };
        let (_sim, device) = open_sim_with(SimConfig::default(), &settings);
        let mut ctx = ExecContext::create(&device, Engines::COPY).unwrap();
        let (_segment, entry) = noop_segment(&ctx);
        assert!(matches!(
            ctx.exec(&[entry, entry, entry]),
            Err(GpuError::RingFull { capacity: 4 })
        ));
        assert_eq!(ctx.pending(), 0);
        ctx.exec(&[entry, entry]).unwrap();
        ctx.flush().unwrap();
    }

    #[test]
    fn test_exec_rejects_bad_entries_atomically() {
        let (_sim, mut ctx) = context(SimConfig::default());
        let (_segment, entry) = noop_segment(&ctx);
        let bad = PushEntry { length: 6, ..entry };
        assert!(ctx.exec(&[entry, bad]).is_err());
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_full_command_buffer_still_flushes() {
        let settings = Settings {
            command_buffer_size: PAGE_SIZE,
            ..Settings::default()
        };
        let (_sim, device) = open_sim_with(SimConfig::default(), &settings);
        let mut ctx = ExecContext::create(&device, Engines::COPY).unwrap();
        let words = (PAGE_SIZE / 4) as usize;

        let mut stream = ctx.stream();
        while stream.wait_for_idle().is_ok() {}
        assert_eq!(stream.len(), words - RELEASE_WORDS);
        ctx.push(&stream).unwrap();
        assert_eq!(ctx.stream().capacity(), 0);

        assert_eq!(ctx.flush().unwrap(), 1);
        assert_eq!(ctx.completed().unwrap(), 1);
        assert_eq!(ctx.stream().capacity(), words - RELEASE_WORDS);

        // A stream built without the reservation is turned away untouched.
        let mut greedy = CommandStream::new(device.arch(), true, words);
        while greedy.wait_for_idle().is_ok() {}
        assert!(matches!(
            ctx.push(&greedy),
            Err(GpuError::CommandBufferFull { .. })
        ));
        assert_eq!(ctx.pending(), 0);
        assert_eq!(ctx.flush().unwrap(), 2);
    }

    #[test]
    fn test_failed_submit_leaves_sequence_untouched() {
        let (sim, mut ctx) = context(SimConfig::default());
        let (_segment, entry) = noop_segment(&ctx);
        ctx.exec(&[entry]).unwrap();
        let put = ctx.ring_put();

        // The first resource manager call of a flush arms the waiter.
        sim.fail_nth_call(1);
        let err = ctx.flush().unwrap_err();
        sim.clear_failure();
        assert!(err.is_status(nvrm_common::status::NV_ERR_GENERIC));
        assert_eq!(ctx.sequence(), 0);
        assert_eq!(ctx.state(), ContextState::Ready);
        assert_eq!(ctx.pending(), 1);
        assert_eq!(ctx.ring_put(), put);

        assert_eq!(ctx.flush().unwrap(), 1);
        assert_eq!(ctx.completed().unwrap(), 1);
        assert_eq!(sim.stats().waiters_signalled, 1);
    }

    #[test]
    fn test_engine_type_follows_engines() {
        assert_eq!(Engines::COPY.engine_type(), engine_type::COPY0);
        assert_eq!(
            (Engines::COPY | Engines::COMPUTE).engine_type(),
            engine_type::GRAPHICS
        );
        assert_eq!(Engines::all().engine_type(), engine_type::GRAPHICS);

        let (_sim, device) = open_sim(SimConfig::default());
        let mut ctx = ExecContext::create(&device, Engines::COPY).unwrap();
        ctx.set_object(SubChannel::Copy).unwrap();
        assert_eq!(ctx.flush().unwrap(), 1);
    }

    #[test]
    fn test_legacy_channel_without_doorbell() {
        let (sim, mut ctx) = context(SimConfig::default().with_arch(GpuArch::Pascal));
        assert_eq!(ctx.token(), None);
        assert_eq!(ctx.flush().unwrap(), 1);
        assert_eq!(ctx.flush().unwrap(), 2);
        let stats = sim.stats();
        assert_eq!(stats.doorbells, 0);
        assert_eq!(stats.semaphore_releases, 2);
    }

    #[test]
    fn test_32bit_semaphores_complete() {
        let config = SimConfig {
            semaphores_64bit: false,
            ..SimConfig::default()
        };
        let (_sim, mut ctx) = context(config);
        for n in 1..=3 {
            assert_eq!(ctx.flush().unwrap(), n);
        }
        assert_eq!(ctx.completed().unwrap(), 3);
    }

    #[test]
    fn test_spurious_wakeups_are_retried() {
        let (sim, mut ctx) = context(SimConfig::default());
        sim.spurious_wakeups(4);
        assert_eq!(ctx.flush().unwrap(), 1);
        assert_eq!(sim.stats().spurious_wakeups, 4);
    }

    #[test]
    fn test_flush_blocks_until_gpu_runs() {
        let (sim, mut ctx) = context(SimConfig::default());
        sim.hold_gpu(true);
        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let done = done.clone();
            std::thread::spawn(move || {
                let seq = ctx.flush().unwrap();
                done.store(true, Ordering::SeqCst);
                (seq, ctx)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        sim.hold_gpu(false);
        let (seq, ctx) = worker.join().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(ctx.completed().unwrap(), 1);
    }

    #[test]
    fn test_set_object_and_engine_methods() {
        let (sim, mut ctx) = context(SimConfig::default());
        ctx.set_object(SubChannel::Compute).unwrap();
        let mut stream = ctx.stream();
        stream
            .method(SubChannel::Compute as u32, host::ENGINE_METHOD_BASE, &[1, 2, 3])
            .unwrap();
        ctx.push(&stream).unwrap();
        ctx.flush().unwrap();
        let stats = sim.stats();
        assert_eq!(stats.engine_methods, 3);
        assert_eq!(stats.invalid_methods, 0);

        let mut copy_only = ExecContext::create(ctx.device(), Engines::COPY).unwrap();
        assert!(copy_only.set_object(SubChannel::Threed).is_err());
        assert!(copy_only.set_object(SubChannel::Copy).is_ok());
    }

    #[test]
    fn test_cross_context_wait_and_signal() {
        let (sim, device) = open_sim(SimConfig::default());
        let mut producer = ExecContext::create(&device, Engines::COPY).unwrap();
        let mut consumer = ExecContext::create(&device, Engines::COPY).unwrap();
        let timeline = TimelineSync::new(&device, 0).unwrap();

        // The consumer's work waits on a value nobody has released yet.
        consumer
            .wait(&[SyncPoint {
                timeline: &timeline,
                value: 1,
            }])
            .unwrap();
        consumer.state = ContextState::WaitingForCompletion;
        let seq = consumer.submit().unwrap();
        sim.run_gpu();
        assert!(sim.stats().acquire_stalls > 0);
        assert!(consumer.completed().unwrap() < seq);

        producer
            .signal(&[SyncPoint {
                timeline: &timeline,
                value: 1,
            }])
            .unwrap();
        assert_eq!(timeline.value().unwrap(), 1);
        assert_eq!(consumer.flush().unwrap(), seq);
        assert_eq!(consumer.state(), ContextState::Ready);
    }

    #[test]
    fn test_operations_rejected_while_waiting() {
        let (_sim, mut ctx) = context(SimConfig::default());
        let stream = ctx.stream();
        ctx.state = ContextState::WaitingForCompletion;
        let err = ctx.push(&stream).unwrap_err();
        assert!(matches!(
            err,
            GpuError::InvalidState(ContextState::WaitingForCompletion)
        ));
        ctx.state = ContextState::Ready;
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (sim, device) = open_sim(SimConfig::default());
        let before = sim.stats();
        let mut ctx = ExecContext::create(&device, Engines::all()).unwrap();
        ctx.flush().unwrap();
        drop(ctx);

        let after = sim.stats();
        assert_eq!(after.live_objects, before.live_objects);
        assert_eq!(after.live_cpu_mappings, before.live_cpu_mappings);
        assert_eq!(after.live_gpu_mappings, before.live_gpu_mappings);
        assert_eq!(after.open_events, before.open_events);
        assert_eq!(after.teardown_violations, 0);
        assert_eq!(after.double_frees, 0);
    }

    #[test]
    fn test_partial_create_unwinds_every_step() {
        let (sim, device) = open_sim(SimConfig::default());
        let before = sim.stats();
        let mut n = 1;
        loop {
            let start = sim.stats();
            sim.fail_nth_call(n);
            let result = ExecContext::create(&device, Engines::all());
            sim.clear_failure();
            let stats = sim.stats();
            match result {
                Ok(ctx) => {
                    drop(ctx);
                    break;
                }
                Err(e) => assert_eq!(e.status(), nvrm_common::status::NV_ERR_GENERIC),
            }
            assert_eq!(stats.live_objects, before.live_objects, "leak at step {n}");
            assert_eq!(stats.live_cpu_mappings, before.live_cpu_mappings);
            assert_eq!(stats.live_gpu_mappings, before.live_gpu_mappings);
            assert_eq!(stats.open_events, before.open_events);
            assert_eq!(stats.teardown_violations, 0, "violation at step {n}");
            assert_eq!(stats.double_frees, 0, "double free at step {n}");

            // Every object created in this attempt was freed exactly once;
            // the only alloc without a free is the one that was failed.
            let allocs = stats.calls(Escape::RmAlloc) - start.calls(Escape::RmAlloc);
            let frees = stats.calls(Escape::RmFree) - start.calls(Escape::RmFree);
            assert!(allocs == frees || allocs == frees + 1, "step {n}: {allocs} allocs, {frees} frees");
            assert_eq!(stats.injected_failures - start.injected_failures, 1);
            n += 1;
        }

        let stats = sim.stats();
        assert!(n > 20);
        assert_eq!(stats.teardown_violations, 0);
        assert_eq!(stats.double_frees, 0);
        assert_eq!(stats.live_objects, before.live_objects);
        assert!(stats.calls(Escape::RmFree) > before.calls(Escape::RmFree));
    }
}
