//! Host-driven logging.
//!
//! The host picks the level and the output once with `init_logging` (and may
//! change both later with another call) and can feed its own records into the
//! same output with `log_message`, so host and core logs interleave in one
//! stream. Output goes to stderr, or to an hourly rolling file when the host
//! names one.
//!
//! `RUST_LOG`, when set and valid, overrides the level chosen by the host.
//!
//! ```bash
//! RUST_LOG=flashkv_bridge=trace,warn ./host-app
//! ```

use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

/// Log levels as numbered across the C ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Level used when the host does not pick one.
pub const DEFAULT_LEVEL: Level = Level::Warn;

impl Level {
    /// Maps the C ABI value; anything outside 0..=4 is `None`.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Level::Error),
            1 => Some(Level::Warn),
            2 => Some(Level::Info),
            3 => Some(Level::Debug),
            4 => Some(Level::Trace),
            _ => None,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }
}

type Filtered = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type Output = Box<dyn Layer<Filtered> + Send + Sync>;

struct Logger {
    filter: reload::Handle<EnvFilter, Registry>,
    output: reload::Handle<Output, Filtered>,
    /// Keeps the file writer's worker alive; dropping it flushes the file.
    guard: Mutex<Option<WorkerGuard>>,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

fn stderr_output() -> Output {
    Box::new(fmt::layer::<Filtered>().with_target(true).with_writer(std::io::stderr))
}

/// Builds a layer writing to an hourly rolling file. The parent of `path` is
/// the log directory and its file name the prefix of every rotated file.
fn file_output(path: &Path) -> Result<(Output, WorkerGuard), String> {
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("{} does not name a file", path.display()))?;
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .build(directory)
        .map_err(|e| e.to_string())?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer::<Filtered>()
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer);
    Ok((Box::new(layer), guard))
}

/// Installs the subscriber on first use and applies `level` (or the default)
/// and the output (`file`, or stderr when `None`).
///
/// If the process already installed its own global subscriber, that one
/// stays in charge and only the returned level is meaningful.
pub fn init(level: Option<Level>, file: Option<&Path>) -> Level {
    let level = level.unwrap_or(DEFAULT_LEVEL);
    let (output, guard, file_error) = match file.map(file_output) {
        None => (stderr_output(), None, None),
        Some(Ok((output, guard))) => (output, Some(guard), None),
        Some(Err(e)) => (stderr_output(), None, Some(e)),
    };

    let mut pending = Some(output);
    let logger = LOGGER.get_or_init(|| {
        let (filter, filter_handle) = reload::Layer::new(filter_for(level));
        let output = pending.take().unwrap_or_else(stderr_output);
        let (output, output_handle) = reload::Layer::new(output);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(output)
            .try_init();
        Logger {
            filter: filter_handle,
            output: output_handle,
            guard: Mutex::new(None),
        }
    });

    if let Some(output) = pending {
        if let Err(e) = logger.filter.reload(filter_for(level)) {
            debug!(error = %e, "Log level not changed");
        }
        if let Err(e) = logger.output.reload(output) {
            debug!(error = %e, "Log output not changed");
        }
    }
    // Replacing the guard flushes and stops the previous file writer.
    *logger.guard.lock().unwrap_or_else(PoisonError::into_inner) = guard;

    if let Some(e) = file_error {
        warn!(file = ?file, error = %e, "Cannot log to file, using stderr");
    }

    debug!(level = ?level, file = ?file, "Logging initialized");
    level
}

/// Emits one host record at `level`.
pub fn log(level: Level, identifier: &str, message: &str) {
    if LOGGER.get().is_none() {
        init(None, None);
    }

    match level {
        Level::Error => error!(target: "flashkv_bridge::host", identifier, "{}", message),
        Level::Warn => warn!(target: "flashkv_bridge::host", identifier, "{}", message),
        Level::Info => info!(target: "flashkv_bridge::host", identifier, "{}", message),
        Level::Debug => debug!(target: "flashkv_bridge::host", identifier, "{}", message),
        Level::Trace => trace!(target: "flashkv_bridge::host", identifier, "{}", message),
    }
}

/// Initializes logging. `level` is a [`Level`] value, or -1 for the default
/// (`Warn`). `file_name` selects a rolling log file; null logs to stderr.
/// Returns the level in effect.
///
/// # Safety
///
/// `file_name` must be null or point to a NUL-terminated string valid for
/// the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn init_logging(level: i32, file_name: *const c_char) -> Level {
    let requested = Level::from_raw(level);
    let file = (!file_name.is_null()).then(|| lossy(file_name));
    let applied = panic::catch_unwind(|| init(requested, file.as_deref().map(Path::new)))
        .unwrap_or(DEFAULT_LEVEL);
    if requested.is_none() && level != -1 {
        warn!(level, "Invalid log level, using the default");
    }
    applied
}

/// Logs a host message through the core's subscriber.
///
/// # Safety
///
/// `identifier` and `message` must be null or point to NUL-terminated
/// strings valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn log_message(
    level: i32,
    identifier: *const c_char,
    message: *const c_char,
) {
    let Some(level) = Level::from_raw(level) else {
        warn!(level, "log_message called with an invalid level");
        return;
    };
    let identifier = lossy(identifier);
    let message = lossy(message);
    let _ = panic::catch_unwind(AssertUnwindSafe(|| log(level, &identifier, &message)));
}

unsafe fn lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
