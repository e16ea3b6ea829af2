// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Runtime configuration: boot options, validation, change callbacks
//! OWNERS: @core-team
//! PUBLIC API: Config (from_boot_options/set/subscribe), SchedulerPolicy
//! DEPENDS_ON: diag::log::Level
//! INVARIANTS: Out-of-range values fall back to the default with one warning;
//!             table sizes are boot-time only

extern crate alloc;

use alloc::vec::Vec;

use crate::diag::log::Level;

/// Scheduling policy selector. `Priority` is the implemented default; the
/// other values are accepted from the command line for forward
/// compatibility and currently behave as priority with one or five queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerPolicy {
    Fifo,
    RoundRobin,
    Priority,
}

/// Errors from runtime configuration updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Unknown key or unparseable value.
    Invalid,
    /// The key can only be set from the boot options.
    Immutable,
}

/// Callback invoked after a successful runtime change.
pub type ConfigObserver = fn(&Config);

/// Read-mostly tunables populated from the kernel command line and the
/// parsed configuration blob (both tokenised by the loader).
pub struct Config {
    pub log_level: Level,
    pub scheduler_policy: SchedulerPolicy,
    pub time_slice_ms: u32,
    pub max_threads: usize,
    pub max_domains: usize,
    pub max_capabilities: usize,
    pub max_irqs: usize,
    pub enable_audit: bool,
    pub enable_kaslr: bool,
    pub enable_smep: bool,
    pub enable_smap: bool,
    pub serial_baud: u32,
    observers: Vec<ConfigObserver>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Level::Info,
            scheduler_policy: SchedulerPolicy::Priority,
            time_slice_ms: 10,
            max_threads: 256,
            max_domains: 64,
            max_capabilities: 1024,
            max_irqs: 64,
            enable_audit: true,
            enable_kaslr: false,
            enable_smep: true,
            enable_smap: true,
            serial_baud: 115_200,
            observers: Vec::new(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Builds a configuration from pre-parsed `key=value` pairs. Unknown
    /// keys and out-of-range values are reported once and otherwise ignored.
    pub fn from_boot_options<'a, I>(options: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            if config.apply(key, value).is_err() {
                log_warn!(target: "config", "option '{}={}' rejected, keeping default", key, value);
            }
        }
        config
    }

    /// Applies one option, boot-time keys included.
    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "log_level" => self.log_level = Level::from_str(value).ok_or(ConfigError::Invalid)?,
            "scheduler_policy" => {
                self.scheduler_policy = match value {
                    "fifo" => SchedulerPolicy::Fifo,
                    "rr" => SchedulerPolicy::RoundRobin,
                    "priority" => SchedulerPolicy::Priority,
                    _ => return Err(ConfigError::Invalid),
                }
            }
            "time_slice_ms" => {
                self.time_slice_ms = parse_in_range(value, 1, 1_000)? as u32;
            }
            "max_threads" => self.max_threads = parse_in_range(value, 16, 4_096)?,
            "max_domains" => self.max_domains = parse_in_range(value, 8, 1_024)?,
            // Capability ids are 16-bit; the table can never exceed that.
            "max_capabilities" => self.max_capabilities = parse_in_range(value, 64, 65_535)?,
            "max_irqs" => self.max_irqs = parse_in_range(value, 16, 256)?,
            "enable_audit" => self.enable_audit = parse_bool(value).ok_or(ConfigError::Invalid)?,
            "enable_kaslr" => self.enable_kaslr = parse_bool(value).ok_or(ConfigError::Invalid)?,
            "enable_smep" => self.enable_smep = parse_bool(value).ok_or(ConfigError::Invalid)?,
            "enable_smap" => self.enable_smap = parse_bool(value).ok_or(ConfigError::Invalid)?,
            "serial_baud" => {
                let baud = parse_in_range(value, 9_600, 115_200)? as u32;
                if ![9_600, 19_200, 38_400, 57_600, 115_200].contains(&baud) {
                    return Err(ConfigError::Invalid);
                }
                self.serial_baud = baud;
            }
            _ => return Err(ConfigError::Invalid),
        }
        Ok(())
    }

    /// Runtime update. Only the read-mostly tunables may change after boot;
    /// table geometry is frozen. Observers run after the change lands.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "log_level" | "time_slice_ms" | "enable_audit" => self.apply(key, value)?,
            "scheduler_policy" | "max_threads" | "max_domains" | "max_capabilities"
            | "max_irqs" | "enable_kaslr" | "enable_smep" | "enable_smap" | "serial_baud" => {
                return Err(ConfigError::Immutable)
            }
            _ => return Err(ConfigError::Invalid),
        }
        log_info!(target: "config", "runtime change: {}={}", key, value);
        for observer in &self.observers {
            observer(self);
        }
        Ok(())
    }

    /// Registers a change callback. The observer also runs once immediately
    /// so it can pick up the boot-time value.
    pub fn subscribe(&mut self, observer: ConfigObserver) {
        observer(self);
        self.observers.push(observer);
    }

    /// Ticks of the scheduler slice, assuming the 1 ms tick the timer
    /// programs.
    pub fn slice_ticks(&self) -> u32 {
        self.time_slice_ms
    }
}

fn parse_in_range(value: &str, min: usize, max: usize) -> Result<usize, ConfigError> {
    let parsed: usize = value.parse().map_err(|_| ConfigError::Invalid)?;
    if parsed < min || parsed > max {
        return Err(ConfigError::Invalid);
    }
    Ok(parsed)
}
