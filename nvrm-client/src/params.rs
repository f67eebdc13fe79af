// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-layout parameter blocks for the resource manager escapes, class
//! allocations and control calls.
//!
//! All blocks are little-endian with natural alignment padding spelled out as
//! explicit `padN` fields, so `SIZE` is exactly the number of bytes on the
//! wire.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// A parameter block with a fixed little-endian wire layout.
pub trait Wire: Sized {
    const SIZE: usize;

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn decode<R: Read>(r: &mut R) -> io::Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        // Writing into a Vec cannot fail.
        let _ = self.encode(&mut buf);
        buf
    }

    fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("parameter block too short: {} < {}", buf.len(), Self::SIZE),
            ));
        }
        Self::decode(&mut Cursor::new(buf))
    }
}

/// A single scalar field inside a [`Wire`] block.
pub trait WireField: Sized {
    const SIZE: usize;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn get<R: Read>(r: &mut R) -> io::Result<Self>;
}

impl WireField for u8 {
    const SIZE: usize = 1;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(*self)
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_u8()
    }
}

impl WireField for u16 {
    const SIZE: usize = 2;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(*self)
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl WireField for u32 {
    const SIZE: usize = 4;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(*self)
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl WireField for i32 {
    const SIZE: usize = 4;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(*self)
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl WireField for u64 {
    const SIZE: usize = 8;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(*self)
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl<const N: usize> WireField for [u32; N] {
    const SIZE: usize = 4 * N;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for v in self {
            w.write_u32::<LittleEndian>(*v)?;
        }
        Ok(())
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut out = [0u32; N];
        r.read_u32_into::<LittleEndian>(&mut out)?;
        Ok(out)
    }
}

impl<const N: usize> WireField for [u8; N] {
    const SIZE: usize = N;
    fn put<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self)
    }
    fn get<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut out = [0u8; N];
        r.read_exact(&mut out)?;
        Ok(out)
    }
}

macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident: $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl Wire for $name {
            const SIZE: usize = 0 $( + <$ty as WireField>::SIZE )*;

            fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
                $( WireField::put(&self.$field, w)?; )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
                Ok(Self { $( $field: <$ty as WireField>::get(r)?, )* })
            }
        }
    };
}

/// Empty parameter block, for classes and controls that take none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoParams;

impl Wire for NoParams {
    const SIZE: usize = 0;
    fn encode<W: Write>(&self, _w: &mut W) -> io::Result<()> {
        Ok(())
    }
    fn decode<R: Read>(_r: &mut R) -> io::Result<Self> {
        Ok(Self)
    }
}

// ── Escape headers ──────────────────────────────────────────────────────────

wire_struct! {
    /// `RmAlloc` header; the class parameter block follows inline.
    #[derive(Default)]
    pub struct AllocHeader {
        pub h_root: u32,
        pub h_object_parent: u32,
        /// In: requested handle, or 0 to let the RM choose. Out: new handle.
        pub h_object_new: u32,
        pub h_class: u32,
        pub params_size: u32,
        pub status: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct FreeParams {
        pub h_root: u32,
        pub h_object_parent: u32,
        pub h_object_old: u32,
        pub status: u32,
    }
}

wire_struct! {
    /// `RmControl` header; the control parameter block follows inline.
    #[derive(Default)]
    pub struct ControlHeader {
        pub h_client: u32,
        pub h_object: u32,
        pub cmd: u32,
        pub flags: u32,
        pub params_size: u32,
        pub status: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct MapMemoryParams {
        pub h_client: u32,
        pub h_device: u32,
        pub h_memory: u32,
        pub pad0: u32,
        pub offset: u64,
        pub length: u64,
        /// Out: opaque linear address later passed to the CPU mapping call.
        pub linear_address: u64,
        pub status: u32,
        pub flags: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct UnmapMemoryParams {
        pub h_client: u32,
        pub h_device: u32,
        pub h_memory: u32,
        pub pad0: u32,
        pub linear_address: u64,
        pub status: u32,
        pub flags: u32,
    }
}

/// `flags` bits of [`MapMemoryDmaParams`].
pub mod dma_flags {
    pub const CACHE_SNOOP_DISABLE: u32 = 0 << 4;
    pub const CACHE_SNOOP_ENABLE: u32 = 1 << 4;
    pub const PAGE_SIZE_4KB: u32 = 1 << 8;
    pub const DMA_OFFSET_FIXED: u32 = 1 << 15;
}

wire_struct! {
    #[derive(Default)]
    pub struct MapMemoryDmaParams {
        pub h_client: u32,
        pub h_device: u32,
        pub h_dma: u32,
        pub h_memory: u32,
        pub offset: u64,
        pub length: u64,
        pub flags: u32,
        pub pad0: u32,
        /// In: offset inside the virtual object when `DMA_OFFSET_FIXED`.
        /// Out: GPU virtual address of the mapping.
        pub dma_offset: u64,
        pub status: u32,
        pub pad1: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct UnmapMemoryDmaParams {
        pub h_client: u32,
        pub h_device: u32,
        pub h_dma: u32,
        pub h_memory: u32,
        pub flags: u32,
        pub pad0: u32,
        pub dma_offset: u64,
        pub status: u32,
        pub pad1: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct OsEventParams {
        pub h_client: u32,
        pub h_device: u32,
        pub fd: i32,
        pub status: u32,
    }
}

/// Number of records returned by the card-info escape.
pub const MAX_CARDS: usize = 32;

wire_struct! {
    #[derive(Default)]
    pub struct CardInfo {
        pub valid: u32,
        pub gpu_id: u32,
        pub minor_number: u32,
        pub domain: u32,
        pub bus: u8,
        pub slot: u8,
        pub function: u8,
        pub pad0: u8,
        pub vendor_id: u16,
        pub device_id: u16,
    }
}

/// Length of the version string exchanged by the version check.
pub const VERSION_STRING_LENGTH: usize = 64;

/// Interface version this client speaks.
pub const DRIVER_VERSION: &str = "550.54.14";

pub const CHECK_VERSION_CMD_STRICT: u32 = 0;
pub const CHECK_VERSION_REPLY_UNRECOGNIZED: u32 = 0;
pub const CHECK_VERSION_REPLY_RECOGNIZED: u32 = 1;

wire_struct! {
    pub struct CheckVersionParams {
        pub cmd: u32,
        pub reply: u32,
        pub version_string: [u8; VERSION_STRING_LENGTH],
    }
}

impl CheckVersionParams {
    pub fn new(version: &str) -> Self {
        let mut version_string = [0u8; VERSION_STRING_LENGTH];
        let n = version.len().min(VERSION_STRING_LENGTH - 1);
        version_string[..n].copy_from_slice(&version.as_bytes()[..n]);
        Self {
            cmd: CHECK_VERSION_CMD_STRICT,
            reply: CHECK_VERSION_REPLY_UNRECOGNIZED,
            version_string,
        }
    }

    pub fn version(&self) -> &str {
        let end = self
            .version_string
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_STRING_LENGTH);
        std::str::from_utf8(&self.version_string[..end]).unwrap_or("")
    }
}

// ── Class allocation parameters ─────────────────────────────────────────────

wire_struct! {
    #[derive(Default)]
    pub struct DeviceAllocParams {
        pub device_id: u32,
        pub flags: u32,
        pub va_space_size: u64,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct SubdeviceAllocParams {
        pub sub_device_id: u32,
    }
}

pub const VASPACE_FLAGS_ENABLE_PAGE_FAULTING: u32 = 1 << 2;

wire_struct! {
    #[derive(Default)]
    pub struct VaSpaceAllocParams {
        pub index: u32,
        pub flags: u32,
        pub va_size: u64,
        pub va_base: u64,
    }
}

/// `type` values of [`MemoryAllocParams`].
pub mod memory_type {
    pub const IMAGE: u32 = 0;
    pub const DEPTH: u32 = 1;
    pub const TEXTURE: u32 = 2;
}

/// `attr` bit-fields of [`MemoryAllocParams`].
pub mod memory_attr {
    pub const DEPTH_SHIFT: u32 = 0;
    pub const DEPTH_MASK: u32 = 0x3F;
    pub const DEPTH_UNKNOWN: u32 = 0;
    pub const DEPTH_16: u32 = 4;
    pub const DEPTH_32: u32 = 6;
    pub const Z_TYPE_FIXED: u32 = 0 << 6;
    pub const Z_TYPE_FLOAT: u32 = 1 << 6;
    pub const ZS_PACKING_SHIFT: u32 = 7;
    pub const ZS_PACKING_MASK: u32 = 0xF;
    pub const ZS_PACKING_Z24S8: u32 = 0;
    pub const ZS_PACKING_S8Z24: u32 = 1;
    pub const ZS_PACKING_Z32: u32 = 2;
    pub const ZS_PACKING_Z16: u32 = 4;
    pub const ZS_PACKING_Z32_X24S8: u32 = 8;
    pub const FORMAT_PITCH: u32 = 0 << 16;
    pub const FORMAT_BLOCK_LINEAR: u32 = 1 << 16;
    pub const PAGE_SIZE_4KB: u32 = 1 << 23;
    pub const PHYSICALITY_CONTIGUOUS: u32 = 1 << 27;
    pub const LOCATION_VIDMEM: u32 = 0 << 25;
    pub const LOCATION_PCI: u32 = 1 << 25;
    pub const COHERENCY_CACHED: u32 = 0 << 29;
    pub const COHERENCY_UNCACHED: u32 = 1 << 29;
}

/// `flags` bits of [`MemoryAllocParams`].
pub mod memory_flags {
    pub const MAP_NOT_REQUIRED: u32 = 1 << 1;
    pub const KIND_FIXED: u32 = 1 << 2;
    pub const FIXED_ADDRESS_ALLOCATE: u32 = 1 << 8;
    pub const VIRTUAL: u32 = 1 << 9;
}

wire_struct! {
    #[derive(Default)]
    pub struct MemoryAllocParams {
        pub owner: u32,
        pub type_: u32,
        pub flags: u32,
        pub width: u32,
        pub height: u32,
        pub pitch: u32,
        pub attr: u32,
        pub attr2: u32,
        /// In: requested page kind. Out: negotiated page kind.
        pub format: u32,
        pub compr_covg: u32,
        pub zcull_covg: u32,
        pub h_va_space: u32,
        pub range_lo: u64,
        pub range_hi: u64,
        pub size: u64,
        pub alignment: u64,
        /// In: fixed address when `FIXED_ADDRESS_ALLOCATE`. Out: placement.
        pub offset: u64,
        pub limit: u64,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct ContextDmaAllocParams {
        pub flags: u32,
        pub h_memory: u32,
        pub offset: u64,
        pub limit: u64,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct ChannelAllocParams {
        pub h_object_error: u32,
        pub h_object_buffer: u32,
        pub gp_fifo_offset: u64,
        pub gp_fifo_entries: u32,
        pub flags: u32,
        pub h_context_share: u32,
        pub h_va_space: u32,
        pub h_userd_memory: u32,
        pub pad0: u32,
        pub userd_offset: u64,
        pub engine_type: u32,
        pub pad1: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct SemaphoreSurfaceAllocParams {
        pub h_semaphore_mem: u32,
        pub h_max_submitted_mem: u32,
        pub flags: u64,
    }
}

// ── Control calls ───────────────────────────────────────────────────────────

/// Control command identifiers.
pub mod ctrl {
    pub const DEVICE_GET_CLASSLIST_V2: u32 = 0x0080_0292;
    pub const FB_GET_SEMAPHORE_SURFACE_LAYOUT: u32 = 0x2080_1352;
    pub const GPFIFO_SCHEDULE: u32 = 0xA06F_0103;
    pub const GET_WORK_SUBMIT_TOKEN: u32 = 0xC36F_0108;
    pub const SEMSURF_BIND_CHANNEL: u32 = 0x00DA_0002;
    pub const SEMSURF_REGISTER_WAITER: u32 = 0x00DA_0003;
    pub const SEMSURF_SET_VALUE: u32 = 0x00DA_0004;
    pub const SEMSURF_UNREGISTER_WAITER: u32 = 0x00DA_0005;
    pub const SEMSURF_UNBIND_CHANNEL: u32 = 0x00DA_0006;
}

pub const CLASSLIST_MAX_SIZE: usize = 160;

wire_struct! {
    pub struct ClassListParams {
        pub num_classes: u32,
        pub class_list: [u32; CLASSLIST_MAX_SIZE],
    }
}

impl Default for ClassListParams {
    fn default() -> Self {
        Self {
            num_classes: 0,
            class_list: [0; CLASSLIST_MAX_SIZE],
        }
    }
}

impl ClassListParams {
    pub fn classes(&self) -> &[u32] {
        let n = (self.num_classes as usize).min(CLASSLIST_MAX_SIZE);
        &self.class_list[..n]
    }
}

pub const SEMAPHORE_SURFACE_CAPS_64BIT_SUPPORTED: u32 = 1 << 0;

wire_struct! {
    #[derive(Default)]
    pub struct SemaphoreSurfaceLayoutParams {
        pub caps: u32,
        pub size: u32,
        pub max_submitted_semaphore_value_offset: u32,
        pub monitored_fence_threshold_offset: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct GpfifoScheduleParams {
        pub enable: u32,
        pub skip_submit: u32,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct WorkSubmitTokenParams {
        pub work_submit_token: u32,
    }
}

/// Hardware limit on notification indices per bind/unbind call.
pub const SEMSURF_MAX_NOTIFY_INDICES: usize = 64;

wire_struct! {
    pub struct SemSurfChannelParams {
        pub h_channel: u32,
        pub num_notify_indices: u32,
        pub notify_indices: [u32; SEMSURF_MAX_NOTIFY_INDICES],
    }
}

impl SemSurfChannelParams {
    /// Build a bind/unbind block. Returns `None` if `indices` does not fit.
    pub fn new(h_channel: u32, indices: &[u32]) -> Option<Self> {
        if indices.len() > SEMSURF_MAX_NOTIFY_INDICES {
            return None;
        }
        let mut notify_indices = [0u32; SEMSURF_MAX_NOTIFY_INDICES];
        notify_indices[..indices.len()].copy_from_slice(indices);
        Some(Self {
            h_channel,
            num_notify_indices: indices.len() as u32,
            notify_indices,
        })
    }

    pub fn indices(&self) -> &[u32] {
        let n = (self.num_notify_indices as usize).min(SEMSURF_MAX_NOTIFY_INDICES);
        &self.notify_indices[..n]
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct SemSurfRegisterWaiterParams {
        pub index: u64,
        pub wait_value: u64,
        /// Value the RM writes once the wait is satisfied, 0 for none.
        pub new_value: u64,
        pub notification_handle: u64,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct SemSurfUnregisterWaiterParams {
        pub index: u64,
        pub wait_value: u64,
        pub notification_handle: u64,
    }
}

wire_struct! {
    #[derive(Default)]
    pub struct SemSurfSetValueParams {
        pub index: u64,
        pub new_value: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(AllocHeader::SIZE, 24);
        assert_eq!(FreeParams::SIZE, 16);
        assert_eq!(ControlHeader::SIZE, 24);
        assert_eq!(MapMemoryParams::SIZE, 48);
        assert_eq!(MapMemoryDmaParams::SIZE, 56);
        assert_eq!(CardInfo::SIZE, 24);
        assert_eq!(SemSurfChannelParams::SIZE, 8 + 4 * 64);
        assert_eq!(NoParams::SIZE, 0);
    }

    #[test]
    fn test_map_dma_layout_is_little_endian() {
        let p = MapMemoryDmaParams {
            h_client: 1,
            h_dma: 0x22,
            dma_offset: 0x1_0000_2000,
            ..Default::default()
        };
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), MapMemoryDmaParams::SIZE);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x22, 0, 0, 0]);
        assert_eq!(&bytes[40..48], &0x1_0000_2000u64.to_le_bytes());
    }

    #[test]
    fn test_from_bytes_rejects_short_buffer() {
        let err = FreeParams::from_bytes(&[0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_channel_params_bounds() {
        let ok = SemSurfChannelParams::new(5, &[0, 1]).unwrap();
        assert_eq!(ok.indices(), &[0, 1]);
        let too_many = vec![0u32; SEMSURF_MAX_NOTIFY_INDICES + 1];
        assert!(SemSurfChannelParams::new(5, &too_many).is_none());
    }

    #[test]
    fn test_version_string_truncates_and_terminates() {
        let p = CheckVersionParams::new("550.54.14");
        assert_eq!(p.version(), "550.54.14");
        let long = "x".repeat(100);
        let p = CheckVersionParams::new(&long);
        assert_eq!(p.version().len(), VERSION_STRING_LENGTH - 1);
    }
}
