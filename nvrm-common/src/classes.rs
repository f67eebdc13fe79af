// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Object classes and per-architecture encoding tables.
//!
//! Everything that differs between GPU generations is collected in an
//! immutable [`ArchTable`], selected once at device bring-up from the class
//! list the resource manager reports, and passed explicitly to whatever needs
//! it (encoder, context constructors, the simulator's front-end).

/// Resource manager object classes that are not architecture specific.
pub mod class {
    pub const NV01_ROOT_CLIENT: u32 = 0x0000;
    pub const NV01_CONTEXT_DMA: u32 = 0x0002;
    pub const NV01_MEMORY_SYSTEM: u32 = 0x003E;
    pub const NV01_MEMORY_LOCAL_USER: u32 = 0x0040;
    pub const NV01_DEVICE_0: u32 = 0x0080;
    pub const NV_SEMAPHORE_SURFACE: u32 = 0x00DA;
    pub const NV20_SUBDEVICE_0: u32 = 0x2080;
    pub const NV50_MEMORY_VIRTUAL: u32 = 0x50A0;
    pub const FERMI_VASPACE_A: u32 = 0x90F1;
    pub const FERMI_TWOD_A: u32 = 0x902D;
    pub const KEPLER_INLINE_TO_MEMORY_B: u32 = 0xA140;
}

/// GPFIFO subchannel assignment used by every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubChannel {
    Threed = 0,
    Compute = 1,
    InlineToMemory = 2,
    Twod = 3,
    Copy = 4,
}

impl SubChannel {
    pub const ALL: [SubChannel; 5] = [
        Self::Threed,
        Self::Compute,
        Self::InlineToMemory,
        Self::Twod,
        Self::Copy,
    ];

    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Threed),
            1 => Some(Self::Compute),
            2 => Some(Self::InlineToMemory),
            3 => Some(Self::Twod),
            4 => Some(Self::Copy),
            _ => None,
        }
    }
}

/// Host (channel) semaphore method set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSemaphore {
    /// SEMAPHOREA..D, 32-bit payloads only (Pascal and older).
    Legacy,
    /// SEM_ADDR_LO..SEM_EXECUTE, 32- or 64-bit payloads (Volta and newer).
    Modern,
}

/// Host methods and field values shared by all channel classes.
pub mod host {
    pub const SET_OBJECT: u32 = 0x0000;
    pub const NON_STALL_INTERRUPT: u32 = 0x0020;
    pub const WFI: u32 = 0x0078;
    pub const WFI_SCOPE_ALL: u32 = 1;

    /// First method that belongs to the bound engine rather than the host.
    pub const ENGINE_METHOD_BASE: u32 = 0x0100;

    pub mod legacy {
        pub const SEMAPHOREA: u32 = 0x0010;
        pub const SEMAPHOREB: u32 = 0x0014;
        pub const SEMAPHOREC: u32 = 0x0018;
        pub const SEMAPHORED: u32 = 0x001C;

        pub const OPERATION_MASK: u32 = 0x1F;
        pub const OPERATION_ACQUIRE: u32 = 0x01;
        pub const OPERATION_RELEASE: u32 = 0x02;
        pub const OPERATION_ACQ_GEQ: u32 = 0x04;
        pub const ACQUIRE_SWITCH_ENABLED: u32 = 1 << 12;
        /// RELEASE_WFI is active-low on the legacy method.
        pub const RELEASE_WFI_DIS: u32 = 1 << 20;
        pub const RELEASE_SIZE_4BYTE: u32 = 1 << 24;
    }

    pub mod modern {
        pub const SEM_ADDR_LO: u32 = 0x005C;
        pub const SEM_ADDR_HI: u32 = 0x0060;
        pub const SEM_PAYLOAD_LO: u32 = 0x0064;
        pub const SEM_PAYLOAD_HI: u32 = 0x0068;
        pub const SEM_EXECUTE: u32 = 0x006C;

        pub const OPERATION_MASK: u32 = 0x7;
        pub const OPERATION_ACQUIRE: u32 = 0;
        pub const OPERATION_RELEASE: u32 = 1;
        pub const OPERATION_ACQ_STRICT_GEQ: u32 = 2;
        pub const ACQUIRE_SWITCH_TSG_EN: u32 = 1 << 12;
        pub const RELEASE_WFI_EN: u32 = 1 << 20;
        pub const PAYLOAD_SIZE_64BIT: u32 = 1 << 24;

        pub const ADDR_HI_MASK: u32 = 0x01FF_FFFF;
    }
}

/// Runlist engine a channel is created on.
pub mod engine_type {
    pub const GRAPHICS: u32 = 0x01;
    pub const COPY0: u32 = 0x09;
}

/// Offsets inside the channel's USERD (ring state) page.
pub mod userd {
    pub const GP_GET: usize = 0x88;
    pub const GP_PUT: usize = 0x8C;
    pub const SIZE: u64 = 0x200;
}

/// Offset of the doorbell register inside the usermode page.
pub const USERMODE_NOTIFY_CHANNEL_PENDING: usize = 0x90;

/// Size of the usermode register page that is mapped for the doorbell.
pub const USERMODE_MAP_SIZE: u64 = 0x1000;

/// Supported GPU generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GpuArch {
    Pascal,
    Volta,
    Turing,
    Ampere,
    Ada,
    Hopper,
}

impl GpuArch {
    pub const ALL: [GpuArch; 6] = [
        Self::Pascal,
        Self::Volta,
        Self::Turing,
        Self::Ampere,
        Self::Ada,
        Self::Hopper,
    ];

    /// Encoding table for this generation.
    pub fn table(self) -> &'static ArchTable {
        match self {
            Self::Pascal => &PASCAL,
            Self::Volta => &VOLTA,
            Self::Turing => &TURING,
            Self::Ampere => &AMPERE,
            Self::Ada => &ADA,
            Self::Hopper => &HOPPER,
        }
    }

    /// Pick the newest generation whose channel and 3D classes both appear
    /// in `classes`.
    pub fn from_class_list(classes: &[u32]) -> Option<Self> {
        Self::ALL.iter().rev().copied().find(|arch| {
            let table = arch.table();
            classes.contains(&table.channel) && classes.contains(&table.threed)
        })
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "pascal" => Some(Self::Pascal),
            "volta" => Some(Self::Volta),
            "turing" => Some(Self::Turing),
            "ampere" => Some(Self::Ampere),
            "ada" => Some(Self::Ada),
            "hopper" => Some(Self::Hopper),
            _ => None,
        }
    }
}

/// Class IDs and encodings for one GPU generation.
#[derive(Debug, PartialEq, Eq)]
pub struct ArchTable {
    pub arch: GpuArch,
    /// GPFIFO channel class.
    pub channel: u32,
    /// Usermode (doorbell) class, `None` when GP_PUT alone notifies the GPU.
    pub usermode: Option<u32>,
    pub threed: u32,
    pub compute: u32,
    pub copy: u32,
    pub twod: u32,
    pub inline_to_memory: u32,
    pub host_semaphore: HostSemaphore,
}

impl ArchTable {
    /// Engine class bound to `subc` on this generation.
    pub fn subchannel_class(&self, subc: SubChannel) -> u32 {
        match subc {
            SubChannel::Threed => self.threed,
            SubChannel::Compute => self.compute,
            SubChannel::InlineToMemory => self.inline_to_memory,
            SubChannel::Twod => self.twod,
            SubChannel::Copy => self.copy,
        }
    }

    /// Whether the host semaphore methods can carry a 64-bit payload.
    pub fn supports_64bit_semaphores(&self) -> bool {
        self.host_semaphore == HostSemaphore::Modern
    }
}

static PASCAL: ArchTable = ArchTable {
    arch: GpuArch::Pascal,
    channel: 0xC06F,
    usermode: None,
    threed: 0xC097,
    compute: 0xC0C0,
    copy: 0xC0B5,
    twod: class::FERMI_TWOD_A,
    inline_to_memory: class::KEPLER_INLINE_TO_MEMORY_B,
    host_semaphore: HostSemaphore::Legacy,
};

static VOLTA: ArchTable = ArchTable {
    arch: GpuArch::Volta,
    channel: 0xC36F,
    usermode: Some(0xC361),
    threed: 0xC397,
    compute: 0xC3C0,
    copy: 0xC3B5,
    twod: class::FERMI_TWOD_A,
    inline_to_memory: class::KEPLER_INLINE_TO_MEMORY_B,
    host_semaphore: HostSemaphore::Modern,
};

static TURING: ArchTable = ArchTable {
    arch: GpuArch::Turing,
    channel: 0xC46F,
    usermode: Some(0xC461),
    threed: 0xC597,
    compute: 0xC5C0,
    copy: 0xC5B5,
    twod: class::FERMI_TWOD_A,
    inline_to_memory: class::KEPLER_INLINE_TO_MEMORY_B,
    host_semaphore: HostSemaphore::Modern,
};

static AMPERE: ArchTable = ArchTable {
    arch: GpuArch::Ampere,
    channel: 0xC56F,
    usermode: Some(0xC561),
    threed: 0xC697,
    compute: 0xC6C0,
    copy: 0xC6B5,
    twod: class::FERMI_TWOD_A,
    inline_to_memory: class::KEPLER_INLINE_TO_MEMORY_B,
    host_semaphore: HostSemaphore::Modern,
};

static ADA: ArchTable = ArchTable {
    arch: GpuArch::Ada,
    channel: 0xC56F,
    usermode: Some(0xC661),
    threed: 0xC997,
    compute: 0xC9C0,
    copy: 0xC7B5,
    twod: class::FERMI_TWOD_A,
    inline_to_memory: class::KEPLER_INLINE_TO_MEMORY_B,
    host_semaphore: HostSemaphore::Modern,
};

static HOPPER: ArchTable = ArchTable {
    arch: GpuArch::Hopper,
    channel: 0xC86F,
    usermode: Some(0xC661),
    threed: 0xCB97,
    compute: 0xCBC0,
    copy: 0xC8B5,
    twod: class::FERMI_TWOD_A,
    inline_to_memory: class::KEPLER_INLINE_TO_MEMORY_B,
    host_semaphore: HostSemaphore::Modern,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subchannel_from_raw() {
        assert_eq!(SubChannel::from_raw(0), Some(SubChannel::Threed));
        assert_eq!(SubChannel::from_raw(4), Some(SubChannel::Copy));
        assert_eq!(SubChannel::from_raw(5), None);
    }

    #[test]
    fn test_arch_from_class_list_prefers_newest() {
        let turing = [0xC36F, 0xC46F, 0xC397, 0xC597];
        assert_eq!(GpuArch::from_class_list(&turing), Some(GpuArch::Turing));

        // Ada reuses the Ampere channel class; the 3D class tells them apart.
        let ampere = [0xC56F, 0xC697];
        let ada = [0xC56F, 0xC697, 0xC997];
        assert_eq!(GpuArch::from_class_list(&ampere), Some(GpuArch::Ampere));
        assert_eq!(GpuArch::from_class_list(&ada), Some(GpuArch::Ada));

        assert_eq!(GpuArch::from_class_list(&[0xC46F]), None);
    }

    #[test]
    fn test_legacy_arch_has_no_doorbell() {
        let table = GpuArch::Pascal.table();
        assert!(table.usermode.is_none());
        assert!(!table.supports_64bit_semaphores());
        assert!(GpuArch::Turing.table().supports_64bit_semaphores());
    }

    #[test]
    fn test_subchannel_class() {
        let table = GpuArch::Ampere.table();
        assert_eq!(table.subchannel_class(SubChannel::Threed), 0xC697);
        assert_eq!(table.subchannel_class(SubChannel::Twod), 0x902D);
    }
}
