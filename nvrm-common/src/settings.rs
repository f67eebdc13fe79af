// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use crate::classes::GpuArch;

/// Submission engine settings, populated from config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Submission
    pub ring_entries: u32,
    pub command_buffer_size: u64,
    pub wait_timeout_ms: u64,
    pub notify_indices: Vec<u32>,

    // Address space
    pub va_start: u64,
    pub va_end: u64,
    pub bind_align: u64,

    // Simulator
    pub sim_arch: GpuArch,
    pub sim_64bit_semaphores: bool,
}

impl Settings {
    /// Bounded wait used by every completion poll.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ring_entries: 0x8000,
            command_buffer_size: 0x1_0000,
            wait_timeout_ms: 1000,
            notify_indices: vec![0],
            // Leave the low 4 GiB to fixed-address users.
            va_start: 0x1_0000_0000,
            va_end: 0x100_0000_0000,
            bind_align: crate::PAGE_SIZE,
            sim_arch: GpuArch::Ampere,
            sim_64bit_semaphores: true,
        }
    }
}
