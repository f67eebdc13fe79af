// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPFIFO front-end of the software GPU.
//!
//! Parses 64-bit GPFIFO entries, unpacks 32-bit compressed method headers
//! and splits the resulting register writes into host methods (handled by
//! the channel itself) and engine methods.
//!
//! ## GPFIFO Entry Format (64 bits)
//!
//! | Bits    | Field              |
//! |---------|--------------------|
//! | 31:2    | Address [31:2]     |
//! | 39:32   | Address [39:32]    |
//! | 62:42   | Length (in dwords) |
//! | 63      | Sync wait          |
//!
//! ## Compressed Method Header (32 bits)
//!
//! | Bits    | Field                    |
//! |---------|--------------------------|
//! | 12:0    | Method address >> 2      |
//! | 15:13   | Subchannel               |
//! | 28:16   | Method count / Immd data |
//! | 31:29   | SecOp                    |

use nvrm_common::classes::host::{self, legacy, modern};
use nvrm_common::HostSemaphore;

/// A 64-bit GPFIFO entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpEntry {
    pub entry0: u32,
    pub entry1: u32,
}

impl GpEntry {
    pub fn from_words(entry0: u32, entry1: u32) -> Self {
        Self { entry0, entry1 }
    }

    /// GPU virtual address of the pushbuffer segment.
    pub fn address(&self) -> u64 {
        let lo = (self.entry0 & !3) as u64;
        let hi = (self.entry1 as u64 & 0xFF) << 32;
        hi | lo
    }

    /// Length of the segment in 32-bit words.
    pub fn length(&self) -> u32 {
        (self.entry1 >> 10) & 0x1F_FFFF
    }

    pub fn sync_wait(&self) -> bool {
        self.entry1 >> 31 != 0
    }
}

/// Secondary operation type from compressed method header bits [31:29].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecOp {
    Grp0UseTert = 0,
    IncMethod = 1,
    Grp2UseTert = 2,
    NonIncMethod = 3,
    ImmdDataMethod = 4,
    OneInc = 5,
    Reserved6 = 6,
    EndPbSegment = 7,
}

impl SecOp {
    fn from_raw(v: u32) -> Self {
        match v & 7 {
            0 => Self::Grp0UseTert,
            1 => Self::IncMethod,
            2 => Self::Grp2UseTert,
            3 => Self::NonIncMethod,
            4 => Self::ImmdDataMethod,
            5 => Self::OneInc,
            6 => Self::Reserved6,
            _ => Self::EndPbSegment,
        }
    }
}

/// A parsed compressed method header.
#[derive(Debug, Clone, Copy)]
pub struct CompressedMethod(u32);

impl CompressedMethod {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Method register byte address.
    pub fn method(&self) -> u32 {
        (self.0 & 0x1FFF) << 2
    }

    pub fn subchannel(&self) -> u32 {
        (self.0 >> 13) & 0x7
    }

    pub fn count(&self) -> u32 {
        (self.0 >> 16) & 0x1FFF
    }

    pub fn immd_data(&self) -> u32 {
        (self.0 >> 16) & 0x1FFF
    }

    pub fn sec_op(&self) -> SecOp {
        SecOp::from_raw(self.0 >> 29)
    }
}

/// Receives decoded method writes.
pub trait MethodSink {
    /// Host (channel) method. Return `false` to stall the channel; the
    /// current segment is abandoned and refetched on the next run.
    fn host_method(&mut self, subchannel: u32, method: u32, value: u32) -> bool;

    fn engine_method(&mut self, subchannel: u32, method: u32, value: u32);
}

/// Process one pushbuffer segment. Returns `false` if the sink stalled.
pub fn process_pushbuffer(data: &[u32], sink: &mut dyn MethodSink) -> bool {
    let mut pos = 0;

    while pos < data.len() {
        let header = CompressedMethod::new(data[pos]);
        pos += 1;

        let subchannel = header.subchannel();
        let mut method = header.method();
        let count = header.count() as usize;

        match header.sec_op() {
            SecOp::IncMethod => {
                for i in 0..count {
                    if pos >= data.len() {
                        break;
                    }
                    if !dispatch(sink, subchannel, method + 4 * i as u32, data[pos]) {
                        return false;
                    }
                    pos += 1;
                }
            }
            SecOp::NonIncMethod => {
                for _ in 0..count {
                    if pos >= data.len() {
                        break;
                    }
                    if !dispatch(sink, subchannel, method, data[pos]) {
                        return false;
                    }
                    pos += 1;
                }
            }
            SecOp::OneInc => {
                for i in 0..count {
                    if pos >= data.len() {
                        break;
                    }
                    if !dispatch(sink, subchannel, method, data[pos]) {
                        return false;
                    }
                    pos += 1;
                    if i == 0 {
                        method += 4;
                    }
                }
            }
            SecOp::ImmdDataMethod => {
                if !dispatch(sink, subchannel, method, header.immd_data()) {
                    return false;
                }
            }
            SecOp::EndPbSegment => break,
            SecOp::Grp0UseTert | SecOp::Grp2UseTert | SecOp::Reserved6 => {
                log::trace!(
                    "sim-fe: unhandled SecOp {:?} at pos {}",
                    header.sec_op(),
                    pos - 1
                );
                pos += count;
            }
        }
    }
    true
}

fn dispatch(sink: &mut dyn MethodSink, subchannel: u32, method: u32, value: u32) -> bool {
    if method < host::ENGINE_METHOD_BASE {
        sink.host_method(subchannel, method, value)
    } else {
        sink.engine_method(subchannel, method, value);
        true
    }
}

/// A host method that has an effect beyond latching a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    SetObject(u32),
    WaitForIdle,
    NonStallInterrupt,
    Release { address: u64, payload: u64, wide: bool },
    Acquire { address: u64, payload: u64, wide: bool },
}

/// Per-channel semaphore method latches.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostLatch {
    addr_lo: u32,
    addr_hi: u32,
    payload_lo: u32,
    payload_hi: u32,
}

impl HostLatch {
    fn address(&self) -> u64 {
        ((self.addr_hi as u64) << 32) | (self.addr_lo & !3) as u64
    }

    fn payload(&self, wide: bool) -> u64 {
        if wide {
            ((self.payload_hi as u64) << 32) | self.payload_lo as u64
        } else {
            self.payload_lo as u64
        }
    }

    /// Latch a host method write; returns the operation it triggers, if any.
    pub fn write(&mut self, sem: HostSemaphore, method: u32, value: u32) -> Option<HostOp> {
        match method {
            host::SET_OBJECT => return Some(HostOp::SetObject(value)),
            host::WFI => return Some(HostOp::WaitForIdle),
            host::NON_STALL_INTERRUPT => return Some(HostOp::NonStallInterrupt),
            _ => {}
        }
        match sem {
            HostSemaphore::Modern => self.write_modern(method, value),
            HostSemaphore::Legacy => self.write_legacy(method, value),
        }
    }

    fn write_modern(&mut self, method: u32, value: u32) -> Option<HostOp> {
        match method {
            modern::SEM_ADDR_LO => self.addr_lo = value,
            modern::SEM_ADDR_HI => self.addr_hi = value & modern::ADDR_HI_MASK,
            modern::SEM_PAYLOAD_LO => self.payload_lo = value,
            modern::SEM_PAYLOAD_HI => self.payload_hi = value,
            modern::SEM_EXECUTE => {
                let wide = value & modern::PAYLOAD_SIZE_64BIT != 0;
                let address = self.address();
                let payload = self.payload(wide);
                return match value & modern::OPERATION_MASK {
                    modern::OPERATION_RELEASE => Some(HostOp::Release { address, payload, wide }),
                    modern::OPERATION_ACQ_STRICT_GEQ => Some(HostOp::Acquire { address, payload, wide }),
                    op => {
                        log::trace!("sim-fe: unhandled SEM_EXECUTE operation {op}");
                        None
                    }
                };
            }
            _ => log::trace!("sim-fe: ignored host method 0x{method:03X}=0x{value:X}"),
        }
        None
    }

    fn write_legacy(&mut self, method: u32, value: u32) -> Option<HostOp> {
        match method {
            legacy::SEMAPHOREA => self.addr_hi = value & 0xFF,
            legacy::SEMAPHOREB => self.addr_lo = value,
            legacy::SEMAPHOREC => self.payload_lo = value,
            legacy::SEMAPHORED => {
                let address = self.address();
                let payload = self.payload(false);
                return match value & legacy::OPERATION_MASK {
                    legacy::OPERATION_RELEASE => Some(HostOp::Release { address, payload, wide: false }),
                    legacy::OPERATION_ACQ_GEQ => Some(HostOp::Acquire { address, payload, wide: false }),
                    op => {
                        log::trace!("sim-fe: unhandled SEMAPHORED operation {op}");
                        None
                    }
                };
            }
            _ => log::trace!("sim-fe: ignored host method 0x{method:03X}=0x{value:X}"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that records every write and stalls on a chosen host method.
    #[derive(Default)]
    struct RecordingSink {
        host: Vec<(u32, u32, u32)>,
        engine: Vec<(u32, u32, u32)>,
        stall_on: Option<u32>,
    }

    impl MethodSink for RecordingSink {
        fn host_method(&mut self, subchannel: u32, method: u32, value: u32) -> bool {
            if self.stall_on == Some(method) {
                return false;
            }
            self.host.push((subchannel, method, value));
            true
        }
        fn engine_method(&mut self, subchannel: u32, method: u32, value: u32) {
            self.engine.push((subchannel, method, value));
        }
    }

    fn inc(subc: u32, method: u32, count: u32) -> u32 {
        (1 << 29) | (count << 16) | (subc << 13) | (method >> 2)
    }

    #[test]
    fn test_gp_entry_fields() {
        let entry = GpEntry::from_words(0x0000_2000, 0x01 | (3 << 10) | (1 << 31));
        assert_eq!(entry.address(), 0x1_0000_2000);
        assert_eq!(entry.length(), 3);
        assert!(entry.sync_wait());
    }

    #[test]
    fn test_compressed_method_fields() {
        let hdr = CompressedMethod::new(inc(4, 0x400, 3));
        assert_eq!(hdr.sec_op(), SecOp::IncMethod);
        assert_eq!(hdr.subchannel(), 4);
        assert_eq!(hdr.method(), 0x400);
        assert_eq!(hdr.count(), 3);
    }

    #[test]
    fn test_split_host_and_engine_methods() {
        let mut sink = RecordingSink::default();
        let data = [inc(0, 0x5C, 2), 0x1000, 0x1, inc(1, 0x200, 1), 0xAB];
        assert!(process_pushbuffer(&data, &mut sink));
        assert_eq!(sink.host, vec![(0, 0x5C, 0x1000), (0, 0x60, 0x1)]);
        assert_eq!(sink.engine, vec![(1, 0x200, 0xAB)]);
    }

    #[test]
    fn test_non_inc_and_one_inc() {
        let mut sink = RecordingSink::default();
        let non_inc = (3u32 << 29) | (2 << 16) | (0x200 >> 2);
        let one_inc = (5u32 << 29) | (3 << 16) | (0x300 >> 2);
        let data = [non_inc, 1, 2, one_inc, 3, 4, 5];
        assert!(process_pushbuffer(&data, &mut sink));
        let methods: Vec<u32> = sink.engine.iter().map(|w| w.1).collect();
        assert_eq!(methods, vec![0x200, 0x200, 0x300, 0x304, 0x304]);
    }

    #[test]
    fn test_immediate_and_end_segment() {
        let mut sink = RecordingSink::default();
        let immd = (4u32 << 29) | (0x42 << 16) | (host::NON_STALL_INTERRUPT >> 2);
        let end = 7u32 << 29;
        let data = [immd, end, inc(0, 0x200, 1), 9];
        assert!(process_pushbuffer(&data, &mut sink));
        assert_eq!(sink.host, vec![(0, host::NON_STALL_INTERRUPT, 0x42)]);
        assert!(sink.engine.is_empty());
    }

    #[test]
    fn test_stall_stops_processing() {
        let mut sink = RecordingSink {
            stall_on: Some(modern::SEM_EXECUTE),
            ..Default::default()
        };
        let data = [inc(0, modern::SEM_EXECUTE, 1), 2, inc(1, 0x200, 1), 1];
        assert!(!process_pushbuffer(&data, &mut sink));
        assert!(sink.engine.is_empty());
    }

    #[test]
    fn test_modern_latch_release() {
        let mut latch = HostLatch::default();
        let sem = HostSemaphore::Modern;
        assert_eq!(latch.write(sem, modern::SEM_ADDR_LO, 0x2000), None);
        assert_eq!(latch.write(sem, modern::SEM_ADDR_HI, 0x1), None);
        assert_eq!(latch.write(sem, modern::SEM_PAYLOAD_LO, 7), None);
        assert_eq!(latch.write(sem, modern::SEM_PAYLOAD_HI, 1), None);
        let op = latch.write(
            sem,
            modern::SEM_EXECUTE,
            modern::OPERATION_RELEASE | modern::PAYLOAD_SIZE_64BIT,
        );
        assert_eq!(
            op,
            Some(HostOp::Release {
                address: 0x1_0000_2000,
                payload: 0x1_0000_0007,
                wide: true
            })
        );
        // Without the size flag only the low word is released.
        let op = latch.write(sem, modern::SEM_EXECUTE, modern::OPERATION_ACQ_STRICT_GEQ);
        assert_eq!(
            op,
            Some(HostOp::Acquire {
                address: 0x1_0000_2000,
                payload: 7,
                wide: false
            })
        );
    }

    #[test]
    fn test_legacy_latch_release() {
        let mut latch = HostLatch::default();
        let sem = HostSemaphore::Legacy;
        latch.write(sem, legacy::SEMAPHOREA, 0x2);
        latch.write(sem, legacy::SEMAPHOREB, 0x40);
        latch.write(sem, legacy::SEMAPHOREC, 5);
        let op = latch.write(
            sem,
            legacy::SEMAPHORED,
            legacy::OPERATION_RELEASE | legacy::RELEASE_SIZE_4BYTE,
        );
        assert_eq!(
            op,
            Some(HostOp::Release {
                address: 0x2_0000_0040,
                payload: 5,
                wide: false
            })
        );
        assert_eq!(latch.write(sem, host::WFI, 1), Some(HostOp::WaitForIdle));
    }
}
