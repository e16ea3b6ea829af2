// Copyright 2025 Citadel OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @core-team
//! PUBLIC API: log_* macros, emit(level,target,args), set_sink, set_max_level
//! DEPENDS_ON: spin (sink slot)
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; sink never re-enters

use core::fmt::{self, Arguments, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

/// Logging severity used by the core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn compiled_in(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }

    /// Parses the `log_level` configuration value.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }
}

/// Consumer of finished log lines (UART on hardware, capture buffer in
/// tests). Receives one complete line per call, without the trailing newline.
pub type Sink = fn(&str);

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static SINK: Mutex<Option<Sink>> = Mutex::new(None);

/// Installs the line sink. The default sink discards.
pub fn set_sink(sink: Sink) {
    *SINK.lock() = Some(sink);
}

/// Sets the runtime severity filter (driven by the `log_level` option).
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

struct LineBuf {
    buf: [u8; 256],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self { buf: [0; 256], len: 0 }
    }

    fn as_str(&self) -> &str {
        // Only valid UTF-8 ever enters through Write::write_str.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<log encoding error>")
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        // Over-long lines are truncated, not errors.
        Ok(())
    }
}

/// Emits a structured log line if the level passes both the compile-time and
/// the runtime filter.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.compiled_in() {
        return;
    }
    if (level as u8) > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let sink = match *SINK.lock() {
        Some(sink) => sink,
        None => return,
    };
    let mut line = LineBuf::new();
    let _ = write!(line, "[{} {}] ", level.tag(), target);
    let _ = line.write_fmt(args);
    sink(line.as_str());
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::sync::atomic::{AtomicUsize, Ordering};

    static CAPTURED: AtomicUsize = AtomicUsize::new(0);

    // Other tests share the process-wide sink; count only our own target so
    // their emissions cannot skew the delta.
    fn counting_sink(line: &str) {
        assert!(line.starts_with('['));
        if line.contains("log-filter-test") {
            CAPTURED.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn runtime_filter_gates_emission() {
        set_sink(counting_sink);
        set_max_level(Level::Warn);
        let before = CAPTURED.load(Ordering::Relaxed);
        emit(Level::Error, "log-filter-test", format_args!("boom"));
        emit(Level::Info, "log-filter-test", format_args!("dropped"));
        let after = CAPTURED.load(Ordering::Relaxed);
        assert_eq!(after - before, 1);
        set_max_level(Level::Info);
    }

    #[test]
    fn level_parse_matches_config_values() {
        assert_eq!(Level::from_str("trace"), Some(Level::Trace));
        assert_eq!(Level::from_str("verbose"), None);
    }
}
