// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Semaphore value helpers shared by the CPU side and the software GPU.

/// Rebuild a 64-bit semaphore value from the 32-bit word hardware wrote and
/// the 64-bit "max submitted" shadow.
///
/// The true value never trails the shadow by more than `2^31 - 1`, so if the
/// shadow's low word is below `low` the counter has not yet crossed the
/// shadow's current 4 GiB epoch and the high word is one less.
pub fn reconstruct_value(low: u32, shadow: u64) -> u64 {
    let epoch = if (shadow as u32) < low {
        // Before the first epoch there is nothing to borrow from.
        shadow.checked_sub(1 << 32).unwrap_or(0)
    } else {
        shadow
    };
    (epoch & 0xFFFF_FFFF_0000_0000) | low as u64
}

/// Wrapping "has `value` reached `threshold`" test for 32-bit counters.
pub fn reached_32(value: u32, threshold: u32) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconstruct_same_epoch() {
        assert_eq!(reconstruct_value(5, 7), 5);
        assert_eq!(reconstruct_value(7, 7), 7);
        assert_eq!(reconstruct_value(0x10, 0x3_0000_0020), 0x3_0000_0010);
    }

    #[test]
    fn test_reconstruct_across_wrap() {
        // Submitted just crossed into epoch 1, GPU still in epoch 0.
        let shadow = 0x1_0000_0002;
        assert_eq!(reconstruct_value(0xFFFF_FFFE, shadow), 0xFFFF_FFFE);
        assert_eq!(reconstruct_value(0xFFFF_FFFF, shadow), 0xFFFF_FFFF);
        // GPU caught up with the wrap.
        assert_eq!(reconstruct_value(0x0000_0001, shadow), 0x1_0000_0001);
        assert_eq!(reconstruct_value(0x0000_0002, shadow), 0x1_0000_0002);
    }

    #[test]
    fn test_reconstruct_first_epoch_does_not_underflow() {
        assert_eq!(reconstruct_value(9, 3), 9);
    }

    #[test]
    fn test_reached_32_wraps() {
        assert!(reached_32(5, 3));
        assert!(reached_32(3, 3));
        assert!(!reached_32(2, 3));
        assert!(reached_32(0, u32::MAX));
        assert!(!reached_32(u32::MAX, 0));
    }
}
