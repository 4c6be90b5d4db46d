//! Installs a textual [`log::Log`] sink for hosts embedding the `timer`
//! crate.
//!
//! `timer` itself never calls `log::set_logger` — it only uses the `log`
//! facade, in `Wheel::dump_stats`. This crate is the installer, the way
//! `modules/logging::init` is for the rest of the teacher's workspace,
//! minus the kernel-console `crate_interface` indirection: there is no
//! kernel console here, so it writes straight to stderr instead of routing
//! through a `LogIf` interface a board crate implements elsewhere.

use log::{Level, LevelFilter, Log, Metadata, Record};

static LOGGER: StderrLogger = StderrLogger;

/// Installs the logger and sets the max level from the `TIMER_LOG`
/// environment variable (`error`/`warn`/`info`/`debug`/`trace`, defaulting
/// to `info`), mirroring `modules/logging::init`'s `LOG` variable.
///
/// # Panics
///
/// Panics if a logger has already been installed (via this function or
/// otherwise) — the same contract `log::set_logger` itself carries.
pub fn init() {
    log::set_logger(&LOGGER).expect("timer_log::init called after a logger was already set");
    log::set_max_level(level_from_env());
}

fn level_from_env() -> LevelFilter {
    match std::env::var("TIMER_LOG").ok().as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Color code for `level`, matching `modules/logging::level_to_color_code`.
pub fn level_to_color_code(level: Level) -> u8 {
    match level {
        Level::Error => 31, // Red
        Level::Warn => 93,  // BrightYellow
        Level::Info => 36,  // Blue
        Level::Debug => 32, // Green
        Level::Trace => 90, // BrightBlack
    }
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = level_to_color_code(record.level());
        eprintln!(
            "\u{1B}[{color}m[{}]\u{1B}[0m {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}
