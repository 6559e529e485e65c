//! Logging setup for the daemon and the client
//!
//! Events go through `tracing`. The subscriber always carries a file layer whose
//! sink can be switched on and off while the daemon runs (the `log` admin call),
//! and optionally a stderr layer when running in the foreground.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives
pub const LOG_ENV: &str = "PROMPTD_LOG";

static LOG_FILE: Mutex<Option<File>> = parking_lot::const_mutex(None);

/// Install the global subscriber. Safe to call more than once.
pub fn init(foreground: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(FileSink).with_ansi(false);
    let stderr_layer = foreground.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
}

/// Start appending log output to `path`
pub fn enable_file_logging(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    *LOG_FILE.lock() = Some(file);
    tracing::info!("file logging enabled: {}", path.display());
    Ok(())
}

/// Stop writing log output to a file
pub fn disable_file_logging() {
    if LOG_FILE.lock().take().is_some() {
        tracing::info!("file logging disabled");
    }
}

pub fn is_file_logging_enabled() -> bool {
    LOG_FILE.lock().is_some()
}

/// `MakeWriter` that forwards to the switchable log file, or drops output
#[derive(Debug, Clone, Copy, Default)]
struct FileSink;

struct FileSinkWriter;

impl Write for FileSinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match LOG_FILE.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match LOG_FILE.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FileSinkWriter
    }
}
