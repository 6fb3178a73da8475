use std::{fmt, io, io::Write, os::fd::RawFd, sync::{Mutex, atomic::{AtomicI32, AtomicU8, Ordering}}};

// All agent output goes through one process-wide sink: stderr by default, a file if the
// bootstrap was asked to redirect. Reports and log lines share it; only the worker thread
// and the bootstrap write to it. The raw fd is mirrored in an atomic so the SIGQUIT
// handler can emit its blank line with a bare write(2), without taking the mutex.

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    None = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warning as u8);
static OUTPUT: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);
static OUTPUT_FD: AtomicI32 = AtomicI32::new(2);

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::None,
        1 => LogLevel::Error,
        2 => LogLevel::Warning,
        3 => LogLevel::Info,
        _ => LogLevel::Verbose,
    }
}

pub fn set_output(sink: Box<dyn Write + Send>, fd: RawFd) {
    let mut out = OUTPUT.lock().unwrap_or_else(|e| e.into_inner());
    *out = Some(sink);
    OUTPUT_FD.store(fd, Ordering::Relaxed);
}

// The fd behind the sink (2 unless redirected). Async-signal-safe to read.
pub fn output_fd() -> i32 {
    OUTPUT_FD.load(Ordering::Relaxed)
}

pub fn write_output(args: fmt::Arguments) {
    let mut out = OUTPUT.lock().unwrap_or_else(|e| e.into_inner());
    match &mut *out {
        Some(w) => {
            let _ = w.write_fmt(args);
            let _ = w.flush();
        }
        None => {
            let _ = io::stderr().write_fmt(args);
        }
    }
}

#[macro_export]
macro_rules! out {
    ($($arg:tt)*) => (
        $crate::log::write_output(format_args!($($arg)*))
    );
}

#[macro_export]
macro_rules! outln {
    () => (
        $crate::log::write_output(format_args!("\n"))
    );
    ($($arg:tt)*) => (
        $crate::log::write_output(format_args!("{}\n", format_args!($($arg)*)))
    );
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => (
        if $crate::log::log_level() >= $crate::log::LogLevel::Error {
            $crate::log::write_output(format_args!("error: {}\n", format_args!($($arg)*)));
        }
    );
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => (
        if $crate::log::log_level() >= $crate::log::LogLevel::Warning {
            $crate::log::write_output(format_args!("warning: {}\n", format_args!($($arg)*)));
        }
    );
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => (
        if $crate::log::log_level() >= $crate::log::LogLevel::Info {
            $crate::log::write_output(format_args!("info: {}\n", format_args!($($arg)*)));
        }
    );
}

#[macro_export]
macro_rules! log_verbose {
    ($($arg:tt)*) => (
        if $crate::log::log_level() >= $crate::log::LogLevel::Verbose {
            $crate::log::write_output(format_args!("verbose: {}\n", format_args!($($arg)*)));
        }
    );
}

// The agent runs inside someone else's process; a corrupt debugger state must not be
// silently propagated, so unexpected failures print a diagnostic and abort.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => ({
        $crate::log::write_output(format_args!("fatal: {}\n", format_args!($($arg)*)));
        ::std::process::abort()
    });
}
