// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use nvrm_common::{GpuArch, Settings};
use std::path::PathBuf;

/// Locate nvrm.ini.
pub fn find_config_path() -> Option<PathBuf> {
    // XDG_CONFIG_HOME/nvrm/nvrm.ini
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("nvrm").join("nvrm.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // ~/.config/nvrm/nvrm.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("nvrm")
            .join("nvrm.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from an nvrm.ini file, falling back to defaults for
/// anything missing or malformed.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let mut settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No nvrm config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    match Ini::load_from_file(&config_path) {
        Ok(conf) => apply(&conf, &mut settings),
        Err(e) => warn!("Failed to parse config: {}", e),
    }
    settings
}

/// Accepts decimal or 0x-prefixed hex.
fn parse_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn parse_bool(value: &str) -> bool {
    value.trim() == "true" || value.trim() == "1"
}

fn set_u64(key: &str, value: &str, target: &mut u64) {
    match parse_u64(value) {
        Some(v) => *target = v,
        None => warn!("Ignoring {key} = {value:?}: not a number"),
    }
}

fn apply(conf: &Ini, settings: &mut Settings) {
    // [Submission]
    if let Some(section) = conf.section(Some("Submission")) {
        if let Some(entries) = section.get("ring_entries") {
            match parse_u64(entries).and_then(|v| u32::try_from(v).ok()) {
                Some(v) if v >= 2 => settings.ring_entries = v,
                _ => warn!("Ignoring ring_entries = {entries:?}"),
            }
        }
        if let Some(size) = section.get("command_buffer_size") {
            set_u64("command_buffer_size", size, &mut settings.command_buffer_size);
        }
        if let Some(timeout) = section.get("wait_timeout_ms") {
            set_u64("wait_timeout_ms", timeout, &mut settings.wait_timeout_ms);
        }
        if let Some(indices) = section.get("notify_indices") {
            let parsed: Option<Vec<u32>> = indices
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_u64(s).and_then(|v| u32::try_from(v).ok()))
                .collect();
            match parsed {
                Some(v) if !v.is_empty() => settings.notify_indices = v,
                _ => warn!("Ignoring notify_indices = {indices:?}"),
            }
        }
        debug!(
            "Submission: {} ring entries, 0x{:X} byte command buffer",
            settings.ring_entries, settings.command_buffer_size
        );
    }

    // [AddressSpace]
    if let Some(section) = conf.section(Some("AddressSpace")) {
        if let Some(start) = section.get("va_start") {
            set_u64("va_start", start, &mut settings.va_start);
        }
        if let Some(end) = section.get("va_end") {
            set_u64("va_end", end, &mut settings.va_end);
        }
        if let Some(align) = section.get("bind_align") {
            set_u64("bind_align", align, &mut settings.bind_align);
        }
        if settings.va_start >= settings.va_end {
            let defaults = Settings::default();
            warn!(
                "Empty VA window 0x{:X}..0x{:X}, using defaults",
                settings.va_start, settings.va_end
            );
            settings.va_start = defaults.va_start;
            settings.va_end = defaults.va_end;
        }
    }

    // [Simulator]
    if let Some(section) = conf.section(Some("Simulator")) {
        if let Some(arch) = section.get("arch") {
            match GpuArch::from_name(arch) {
                Some(a) => settings.sim_arch = a,
                None => warn!("Unknown architecture {arch:?}"),
            }
            debug!("Simulator arch: {:?}", settings.sim_arch);
        }
        if let Some(wide) = section.get("semaphores_64bit") {
            settings.sim_64bit_semaphores = parse_bool(wide);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from(text: &str) -> Settings {
        let conf = Ini::load_from_str(text).unwrap();
        let mut settings = Settings::default();
        apply(&conf, &mut settings);
        settings
    }

    #[test]
    fn test_all_sections() {
        let s = settings_from(
            "[Submission]\n\
             ring_entries = 0x100\n\
             command_buffer_size = 8192\n\
             wait_timeout_ms = 50\n\
             notify_indices = 0, 2\n\
             [AddressSpace]\n\
             va_start = 0x2000_0000\n\
             va_end = 0x4000000000\n\
             bind_align = 0x10000\n\
             [Simulator]\n\
             arch = Turing\n\
             semaphores_64bit = false\n",
        );
        assert_eq!(s.ring_entries, 0x100);
        assert_eq!(s.command_buffer_size, 8192);
        assert_eq!(s.wait_timeout_ms, 50);
        assert_eq!(s.notify_indices, vec![0, 2]);
        // Underscores are not accepted in numbers.
        assert_eq!(s.va_start, Settings::default().va_start);
        assert_eq!(s.va_end, 0x40_0000_0000);
        assert_eq!(s.bind_align, 0x1_0000);
        assert_eq!(s.sim_arch, GpuArch::Turing);
        assert!(!s.sim_64bit_semaphores);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let s = settings_from(
            "[Submission]\n\
             ring_entries = 1\n\
             notify_indices = a,b\n\
             [AddressSpace]\n\
             va_start = 0x10000\n\
             va_end = 0x1000\n\
             [Simulator]\n\
             arch = kepler\n",
        );
        let d = Settings::default();
        assert_eq!(s.ring_entries, d.ring_entries);
        assert_eq!(s.notify_indices, d.notify_indices);
        assert_eq!((s.va_start, s.va_end), (d.va_start, d.va_end));
        assert_eq!(s.sim_arch, d.sim_arch);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let s = load_config(Some(&PathBuf::from("/nonexistent/nvrm.ini")));
        assert_eq!(s.ring_entries, Settings::default().ring_entries);
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64(" 0x1F "), Some(31));
        assert_eq!(parse_u64("42"), Some(42));
        assert_eq!(parse_u64("0xZZ"), None);
    }
}
