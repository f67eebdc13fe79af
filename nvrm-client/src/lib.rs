// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod client;
pub mod error;
pub mod mapping;
pub mod object;
pub mod params;
pub mod transport;

pub use client::RmClient;
pub use error::{RmError, RmResult};
pub use mapping::CpuMapping;
pub use object::{OsEvent, RmMapping, RmObject};
pub use params::Wire;
pub use transport::{Errno, Escape, EventFd, RmTransport};
