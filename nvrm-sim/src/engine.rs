// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel execution for the software GPU.
//!
//! Picks up doorbell writes, fetches GPFIFO entries between GP_GET and
//! GP_PUT, and gives host methods their side effects: semaphore releases and
//! acquires, wait-for-idle, non-stall interrupts and subchannel binding.

use std::sync::atomic::Ordering;

use log::{trace, warn};

use nvrm_common::classes::{userd, USERMODE_NOTIFY_CHANNEL_PENDING};
use nvrm_common::semaphore::reached_32;
use nvrm_common::{ArchTable, Handle};

use crate::front_end::{process_pushbuffer, GpEntry, HostLatch, HostOp, MethodSink};
use crate::object_table::{ObjectKind, ObjectTable};
use crate::page_table::GpuPageTable;
use crate::rm::SimStats;

/// Size of one GPFIFO entry in bytes.
const GP_ENTRY_SIZE: u64 = 8;

/// Run every channel that has been told about new work.
pub(crate) fn run(
    objects: &mut ObjectTable,
    mmu: &GpuPageTable,
    stats: &mut SimStats,
    table: &'static ArchTable,
    wide_semaphores: bool,
) {
    let rang = ring_doorbells(objects, stats);
    // Doorbell writes that land between two runs coalesce; any doorbell makes
    // every channel with pending entries eligible.
    let legacy = table.usermode.is_none();
    let runnable: Vec<Handle> = objects
        .iter()
        .filter_map(|(&h, o)| match &o.kind {
            ObjectKind::Channel(c) if c.scheduled && (legacy || rang || c.doorbell_pending) => {
                Some(h)
            }
            _ => None,
        })
        .collect();

    for h in runnable {
        run_channel(objects, mmu, stats, table, wide_semaphores, h);
    }
}

/// Consume doorbell writes. Returns whether any doorbell was rung.
fn ring_doorbells(objects: &mut ObjectTable, stats: &mut SimStats) -> bool {
    let tokens: Vec<u32> = objects
        .iter()
        .filter_map(|(_, o)| match &o.kind {
            ObjectKind::Usermode { page } => Some(
                page.atomic_u32(USERMODE_NOTIFY_CHANNEL_PENDING)
                    .swap(0, Ordering::AcqRel),
            ),
            _ => None,
        })
        .filter(|&token| token != 0)
        .collect();

    for &token in &tokens {
        stats.doorbells += 1;
        let channel = objects.iter_mut().find_map(|(_, o)| match &mut o.kind {
            ObjectKind::Channel(c) if c.token == token => Some(c),
            _ => None,
        });
        match channel {
            Some(c) => {
                trace!("sim-gpu: doorbell token=0x{token:X}");
                c.doorbell_pending = true;
            }
            None => warn!("sim-gpu: doorbell with unknown token 0x{token:X}"),
        }
    }
    !tokens.is_empty()
}

fn run_channel(
    objects: &mut ObjectTable,
    mmu: &GpuPageTable,
    stats: &mut SimStats,
    table: &'static ArchTable,
    wide_semaphores: bool,
    h: Handle,
) {
    let engines: Vec<u32> = objects
        .iter()
        .filter(|(_, o)| o.parent == h && matches!(o.kind, ObjectKind::Engine))
        .map(|(_, o)| o.class)
        .collect();
    let Ok(channel) = objects.channel_mut(h) else {
        return;
    };

    let userd = channel.userd.clone();
    let gp_get = userd.atomic_u32(channel.userd_offset + userd::GP_GET);
    let put = userd
        .atomic_u32(channel.userd_offset + userd::GP_PUT)
        .load(Ordering::Acquire);
    let mut get = gp_get.load(Ordering::Acquire);

    let mut sink = ChannelSink {
        mmu,
        stats,
        table,
        wide_semaphores,
        engines: &engines,
        latch: channel.host,
        subchannels: channel.subchannels,
    };

    let mut stalled = false;
    while get != put {
        if get >= channel.entries || put >= channel.entries {
            warn!(
                "sim-gpu: channel 0x{h:08X} ring offsets out of range get={get} put={put} entries={}",
                channel.entries
            );
            sink.stats.mmu_faults += 1;
            break;
        }
        let entry_va = channel.gpfifo_va + get as u64 * GP_ENTRY_SIZE;
        let Some(words) = mmu.read_words(entry_va, 2) else {
            warn!("sim-gpu: GPFIFO fetch fault at 0x{entry_va:X}");
            sink.stats.mmu_faults += 1;
            break;
        };
        let entry = GpEntry::from_words(words[0], words[1]);
        if entry.length() > 0 {
            let Some(segment) = mmu.read_words(entry.address(), entry.length() as usize) else {
                warn!(
                    "sim-gpu: pushbuffer fetch fault at 0x{:X} len={}",
                    entry.address(),
                    entry.length()
                );
                sink.stats.mmu_faults += 1;
                break;
            };
            if !process_pushbuffer(&segment, &mut sink) {
                stalled = true;
                break;
            }
        }
        get = (get + 1) % channel.entries;
        gp_get.store(get, Ordering::Release);
        sink.stats.gp_entries += 1;
        trace!(
            "sim-gpu: channel 0x{h:08X} executed entry addr=0x{:X} len={} get={get}",
            entry.address(),
            entry.length()
        );
    }

    channel.host = sink.latch;
    channel.subchannels = sink.subchannels;
    channel.doorbell_pending = stalled;
}

/// Method sink for one channel run.
struct ChannelSink<'a> {
    mmu: &'a GpuPageTable,
    stats: &'a mut SimStats,
    table: &'static ArchTable,
    wide_semaphores: bool,
    engines: &'a [u32],
    latch: HostLatch,
    subchannels: [u32; 8],
}

impl ChannelSink<'_> {
    fn release(&mut self, address: u64, payload: u64, wide: bool) {
        let Some((backing, off)) = self.mmu.resolve(address) else {
            warn!("sim-gpu: semaphore release fault at 0x{address:X}");
            self.stats.mmu_faults += 1;
            return;
        };
        if wide && self.wide_semaphores && off % 8 == 0 {
            backing.atomic_u64(off).store(payload, Ordering::Release);
        } else {
            backing.atomic_u32(off).store(payload as u32, Ordering::Release);
        }
        self.stats.semaphore_releases += 1;
        trace!("sim-gpu: release 0x{address:X} <- {payload}");
    }

    fn acquire(&mut self, address: u64, payload: u64, wide: bool) -> bool {
        let Some((backing, off)) = self.mmu.resolve(address) else {
            warn!("sim-gpu: semaphore acquire fault at 0x{address:X}");
            self.stats.mmu_faults += 1;
            return true;
        };
        let reached = if wide && self.wide_semaphores && off % 8 == 0 {
            backing.atomic_u64(off).load(Ordering::Acquire) >= payload
        } else {
            reached_32(backing.atomic_u32(off).load(Ordering::Acquire), payload as u32)
        };
        if reached {
            self.stats.semaphore_acquires += 1;
        } else {
            self.stats.acquire_stalls += 1;
        }
        reached
    }
}

impl MethodSink for ChannelSink<'_> {
    fn host_method(&mut self, subchannel: u32, method: u32, value: u32) -> bool {
        let Some(op) = self.latch.write(self.table.host_semaphore, method, value) else {
            return true;
        };
        match op {
            HostOp::SetObject(class) => {
                if self.engines.contains(&class) {
                    self.subchannels[(subchannel & 7) as usize] = class;
                } else {
                    warn!("sim-gpu: SET_OBJECT with unallocated class 0x{class:04X}");
                    self.stats.invalid_methods += 1;
                }
                true
            }
            HostOp::WaitForIdle => {
                self.stats.wfis += 1;
                true
            }
            HostOp::NonStallInterrupt => {
                self.stats.non_stall_interrupts += 1;
                true
            }
            HostOp::Release {
                address,
                payload,
                wide,
            } => {
                self.release(address, payload, wide);
                true
            }
            HostOp::Acquire {
                address,
                payload,
                wide,
            } => self.acquire(address, payload, wide),
        }
    }

    fn engine_method(&mut self, subchannel: u32, method: u32, _value: u32) {
        if self.subchannels[(subchannel & 7) as usize] == 0 {
            trace!("sim-gpu: method 0x{method:X} on unbound subchannel {subchannel}");
            self.stats.invalid_methods += 1;
        } else {
            self.stats.engine_methods += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nvrm_client::CpuMapping;
    use nvrm_common::classes::engine_type;
    use nvrm_common::classes::host::{self, modern};
    use nvrm_common::GpuArch;

    use crate::object_table::ChannelObject;

    const RING_VA: u64 = 0x10_0000;
    const PB_VA: u64 = 0x20_0000;
    const SEM_VA: u64 = 0x30_0000;

    fn inc(subc: u32, method: u32, count: u32) -> u32 {
        (1 << 29) | (count << 16) | (subc << 13) | (method >> 2)
    }

    struct Rig {
        objects: ObjectTable,
        mmu: GpuPageTable,
        stats: SimStats,
        ring: Arc<CpuMapping>,
        pb: Arc<CpuMapping>,
        sem: Arc<CpuMapping>,
        userd: Arc<CpuMapping>,
        page: Arc<CpuMapping>,
        channel: Handle,
    }

    impl Rig {
        fn new(arch: GpuArch) -> Self {
            let page = |len| Arc::new(CpuMapping::anonymous(len, 0).unwrap());
            let (ring, pb, sem, userd, doorbell) = (page(0x1000), page(0x1000), page(0x1000), page(0x1000), page(0x1000));
            let mut mmu = GpuPageTable::new();
            mmu.map(RING_VA, &ring, 0, 0x1000);
            mmu.map(PB_VA, &pb, 0, 0x1000);
            mmu.map(SEM_VA, &sem, 0, 0x1000);

            let mut objects = ObjectTable::new();
            let client = objects.add(0, 0, 0, ObjectKind::Client).unwrap();
            objects
                .add(client, client, 0, ObjectKind::Usermode { page: doorbell.clone() })
                .unwrap();
            let channel = objects
                .add(
                    client,
                    client,
                    arch.table().channel,
                    ObjectKind::Channel(Box::new(ChannelObject {
                        token: 0x100,
                        engine_type: engine_type::GRAPHICS,
                        gpfifo_va: RING_VA,
                        entries: 16,
                        userd: userd.clone(),
                        userd_offset: 0,
                        scheduled: true,
                        doorbell_pending: false,
                        subchannels: [0; 8],
                        host: HostLatch::default(),
                    })),
                )
                .unwrap();
            objects
                .add(client, channel, arch.table().threed, ObjectKind::Engine)
                .unwrap();
            Self {
                objects,
                mmu,
                stats: SimStats::default(),
                ring,
                pb,
                sem,
                userd,
                page: doorbell,
                channel,
            }
        }

        /// Write `words` at pushbuffer offset `pb_off` and append a ring entry.
        fn submit(&self, slot: u32, pb_off: usize, words: &[u32]) {
            self.pb.write_words(pb_off, words);
            let addr = PB_VA + pb_off as u64;
            self.ring.write_words(
                slot as usize * 8,
                &[addr as u32, ((addr >> 32) as u32) | ((words.len() as u32) << 10)],
            );
            self.userd.write_u32(userd::GP_PUT, slot + 1);
        }

        fn run(&mut self, arch: GpuArch, wide: bool) {
            run(&mut self.objects, &self.mmu, &mut self.stats, arch.table(), wide);
        }

        fn gp_get(&self) -> u32 {
            self.userd.read_u32(userd::GP_GET)
        }
    }

    fn release_words(value: u64) -> Vec<u32> {
        vec![
            inc(0, modern::SEM_ADDR_LO, 5),
            SEM_VA as u32,
            (SEM_VA >> 32) as u32,
            value as u32,
            (value >> 32) as u32,
            modern::OPERATION_RELEASE | modern::PAYLOAD_SIZE_64BIT,
        ]
    }

    #[test]
    fn test_no_work_without_doorbell() {
        let mut rig = Rig::new(GpuArch::Ampere);
        rig.submit(0, 0, &release_words(1));
        rig.run(GpuArch::Ampere, true);
        assert_eq!(rig.gp_get(), 0);
        assert_eq!(rig.stats.gp_entries, 0);
    }

    #[test]
    fn test_doorbell_runs_release() {
        let mut rig = Rig::new(GpuArch::Ampere);
        rig.submit(0, 0, &release_words(0x1_0000_0002));
        rig.page.write_u32(USERMODE_NOTIFY_CHANNEL_PENDING, 0x100);
        rig.run(GpuArch::Ampere, true);
        assert_eq!(rig.stats.doorbells, 1);
        assert_eq!(rig.gp_get(), 1);
        assert_eq!(rig.sem.read_u64(0), 0x1_0000_0002);
        assert_eq!(rig.page.read_u32(USERMODE_NOTIFY_CHANNEL_PENDING), 0);
    }

    #[test]
    fn test_narrow_release_without_64bit_support() {
        let mut rig = Rig::new(GpuArch::Ampere);
        rig.sem.write_u64(0, 0xFFFF_FFFF_FFFF_FFFF);
        rig.submit(0, 0, &release_words(0x1_0000_0002));
        rig.page.write_u32(USERMODE_NOTIFY_CHANNEL_PENDING, 0x100);
        rig.run(GpuArch::Ampere, false);
        assert_eq!(rig.sem.read_u32(0), 2);
        assert_eq!(rig.sem.read_u32(4), 0xFFFF_FFFF);
    }

    #[test]
    fn test_legacy_channel_runs_on_gp_put() {
        let mut rig = Rig::new(GpuArch::Pascal);
        let words = [
            inc(0, host::legacy::SEMAPHOREA, 4),
            (SEM_VA >> 32) as u32,
            SEM_VA as u32,
            7,
            host::legacy::OPERATION_RELEASE,
        ];
        rig.submit(0, 0, &words);
        rig.run(GpuArch::Pascal, false);
        assert_eq!(rig.gp_get(), 1);
        assert_eq!(rig.sem.read_u32(0), 7);
    }

    #[test]
    fn test_acquire_stalls_until_reached() {
        let mut rig = Rig::new(GpuArch::Ampere);
        let acquire = [
            inc(0, modern::SEM_ADDR_LO, 5),
            (SEM_VA + 0x10) as u32,
            0,
            5,
            0,
            modern::OPERATION_ACQ_STRICT_GEQ | modern::PAYLOAD_SIZE_64BIT,
        ];
        rig.submit(0, 0, &acquire);
        rig.page.write_u32(USERMODE_NOTIFY_CHANNEL_PENDING, 0x100);
        rig.run(GpuArch::Ampere, true);
        assert_eq!(rig.gp_get(), 0);
        assert_eq!(rig.stats.acquire_stalls, 1);

        // Still pending; no new doorbell needed.
        rig.sem.write_u64(0x10, 5);
        rig.run(GpuArch::Ampere, true);
        assert_eq!(rig.gp_get(), 1);
        assert_eq!(rig.stats.semaphore_acquires, 1);
    }

    #[test]
    fn test_set_object_and_engine_methods() {
        let mut rig = Rig::new(GpuArch::Ampere);
        let threed = GpuArch::Ampere.table().threed;
        let words = [
            inc(0, 0x200, 1),
            1,
            inc(0, host::SET_OBJECT, 1),
            threed,
            inc(0, 0x200, 2),
            1,
            2,
            inc(1, host::SET_OBJECT, 1),
            0xDEAD,
        ];
        rig.submit(0, 0, &words);
        rig.page.write_u32(USERMODE_NOTIFY_CHANNEL_PENDING, 0x100);
        rig.run(GpuArch::Ampere, true);
        assert_eq!(rig.stats.engine_methods, 2);
        assert_eq!(rig.stats.invalid_methods, 2);
        let channel = rig.objects.channel_mut(rig.channel).unwrap();
        assert_eq!(channel.subchannels[0], threed);
    }

    #[test]
    fn test_unmapped_pushbuffer_faults() {
        let mut rig = Rig::new(GpuArch::Ampere);
        rig.ring.write_words(0, &[0x4000_0000, 4 << 10]);
        rig.userd.write_u32(userd::GP_PUT, 1);
        rig.page.write_u32(USERMODE_NOTIFY_CHANNEL_PENDING, 0x100);
        rig.run(GpuArch::Ampere, true);
        assert_eq!(rig.stats.mmu_faults, 1);
        assert_eq!(rig.gp_get(), 0);
    }
}
