// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod classes;
pub mod semaphore;
pub mod settings;
pub mod status;
pub mod types;

pub use classes::{ArchTable, GpuArch, HostSemaphore, SubChannel};
pub use settings::Settings;
pub use status::NvStatus;
pub use types::*;
