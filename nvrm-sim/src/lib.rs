// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-process resource manager and GPU front-end.
//!
//! [`SoftRm`] implements [`nvrm_client::RmTransport`], so everything built
//! on the client runs unchanged against it.

mod engine;
pub mod front_end;
pub mod object_table;
pub mod page_table;
pub mod rm;

pub use rm::{SimConfig, SimStats, SoftRm, MAX_SUBMITTED_OFFSET, SEMAPHORE_STRIDE};
