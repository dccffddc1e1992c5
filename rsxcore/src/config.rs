// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::{Ini, Properties};
use log::{debug, info, warn};
use rsxcore_common::settings::{Settings, ThreadScheduler};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE: &str = "rsxcore.ini";

/// Locate `rsxcore.ini` in the usual per-user locations.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("rsxcore").join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("rsxcore")
            .join(CONFIG_FILE);
        if path.exists() {
            return Some(path);
        }
    }

    let local = PathBuf::from(CONFIG_FILE);
    local.exists().then_some(local)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_mask(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn read_bool(section: &Properties, key: &str, target: &mut bool) {
    if let Some(raw) = section.get(key) {
        match parse_bool(raw) {
            Some(v) => *target = v,
            None => warn!("Ignoring invalid boolean {}={}", key, raw),
        }
    }
}

fn read_num<T: FromStr + std::fmt::Debug>(section: &Properties, key: &str, target: &mut T) {
    if let Some(raw) = section.get(key) {
        match raw.trim().parse() {
            Ok(v) => {
                *target = v;
                debug!("{} = {:?}", key, target);
            }
            Err(_) => warn!("Ignoring invalid number {}={}", key, raw),
        }
    }
}

/// Apply the sections of a parsed INI on top of `settings`.
pub fn apply_ini(conf: &Ini, settings: &mut Settings) {
    // [Core]
    if let Some(section) = conf.section(Some("Core")) {
        if let Some(scheduler) = section.get("thread_scheduler") {
            settings.thread_scheduler = ThreadScheduler::from_str_or_default(scheduler);
            debug!("Thread scheduler: {:?}", settings.thread_scheduler);
        }
        if let Some(raw) = section.get("rsx_affinity_mask") {
            match parse_mask(raw) {
                Some(mask) => settings.rsx_affinity_mask = mask,
                None => warn!("Ignoring invalid affinity mask {}", raw),
            }
        }
    }

    // [Video]
    if let Some(section) = conf.section(Some("Video")) {
        read_bool(section, "multithreaded_rsx", &mut settings.multithreaded_rsx);
        read_bool(section, "strict_rendering_mode", &mut settings.rsx_accurate_res_access);
        read_bool(section, "precise_zpass_count", &mut settings.precise_zpass_count);
        read_bool(section, "relaxed_zcull_sync", &mut settings.relaxed_zcull_sync);
        read_num(section, "max_immediate_transfer_size", &mut settings.max_immediate_transfer_size);
        read_num(section, "min_zcull_tick_us", &mut settings.min_zcull_tick_us);
        read_num(section, "max_zcull_delay_us", &mut settings.max_zcull_delay_us);
        read_num(section, "max_safe_queue_depth", &mut settings.max_safe_queue_depth);
        read_num(section, "occlusion_query_count", &mut settings.occlusion_query_count);
        read_num(section, "max_stat_registers", &mut settings.max_stat_registers);
        read_num(section, "sync_spin_count", &mut settings.sync_spin_count);
    }

    // [Memory]
    if let Some(section) = conf.section(Some("Memory")) {
        read_num(section, "main_memory_size", &mut settings.main_memory_size);
        read_num(section, "local_memory_size", &mut settings.local_memory_size);
    }

    // [Debugging]
    if let Some(section) = conf.section(Some("Debugging")) {
        read_bool(section, "use_debug_logging", &mut settings.use_debug_logging);
    }
}

/// Load settings from `path`, or from an auto-detected `rsxcore.ini`.
///
/// A missing or unparsable file leaves the defaults in place. A file that
/// parses into an invalid combination also falls back to the defaults.
pub fn load_config(path: Option<&Path>) -> Settings {
    let defaults = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return defaults;
            }
            p.to_path_buf()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No config found, using defaults");
                return defaults;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    let conf = match Ini::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return defaults;
        }
    };

    let mut settings = defaults.clone();
    apply_ini(&conf, &mut settings);
    if let Err(e) = settings.validate() {
        warn!("Invalid config ({}), using defaults", e);
        return defaults;
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Settings {
        let conf = Ini::load_from_str(text).unwrap();
        let mut settings = Settings::default();
        apply_ini(&conf, &mut settings);
        settings
    }

    #[test]
    fn test_video_section() {
        let settings = parse(
            "[Video]\n\
             multithreaded_rsx = false\n\
             strict_rendering_mode = 0\n\
             precise_zpass_count = true\n\
             max_immediate_transfer_size = 1024\n\
             occlusion_query_count = 512\n",
        );
        assert!(!settings.multithreaded_rsx);
        assert!(!settings.rsx_accurate_res_access);
        assert!(settings.precise_zpass_count);
        assert_eq!(settings.max_immediate_transfer_size, 1024);
        assert_eq!(settings.occlusion_query_count, 512);
    }

    #[test]
    fn test_core_section() {
        let settings = parse("[Core]\nthread_scheduler = affinity\nrsx_affinity_mask = 0x3\n");
        assert_eq!(settings.thread_scheduler, ThreadScheduler::Affinity);
        assert_eq!(settings.rsx_affinity_mask, 3);
        assert!(settings.pin_offload_thread());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let settings = parse("[Video]\nmultithreaded_rsx = maybe\nsync_spin_count = lots\n");
        let defaults = Settings::default();
        assert_eq!(settings.multithreaded_rsx, defaults.multithreaded_rsx);
        assert_eq!(settings.sync_spin_count, defaults.sync_spin_count);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = load_config(Some(Path::new("/nonexistent/rsxcore.ini")));
        assert_eq!(settings.occlusion_query_count, Settings::default().occlusion_query_count);
    }
}
