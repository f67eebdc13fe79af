// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command submission on top of the resource-manager client: devices, GPU
//! memory and address space, semaphores and execution contexts.

pub mod bind_ctx;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod exec_ctx;
pub mod gpfifo;
pub mod memory;
pub mod pushbuf;
pub mod semaphore;
pub mod sync;
pub mod va;

pub use bind_ctx::{BindContext, BindOp};
pub use device::Device;
pub use enumerate::{enumerate, open_first};
pub use error::{GpuError, GpuResult};
pub use exec_ctx::{ContextState, Engines, ExecContext, PushEntry, SyncPoint};
pub use memory::{GpuBuffer, PageKind, PhysicalMemory, TileMode, VirtualRange};
pub use pushbuf::CommandStream;
pub use semaphore::{SemaphoreLayout, SemaphoreSurface};
pub use sync::TimelineSync;
