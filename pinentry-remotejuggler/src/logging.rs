//! Log sinks. stdout carries the protocol, so nothing is ever logged there.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const MAX_LOG_BYTES: u64 = 1024 * 1024;
const GENERATIONS: u32 = 3;

/// Install the global subscriber: the log file (if it can be opened) and,
/// in debug mode, stderr.
pub fn init(debug: bool) {
    let filter = EnvFilter::new(if debug { "debug" } else { "info" });

    let file_layer = log_path(
        std::env::var_os("XDG_CACHE_HOME"),
        std::env::var_os("HOME"),
    )
    .and_then(|path| open_log_file(&path).ok())
    .map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });
    let stderr_layer = debug.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

/// `$XDG_CACHE_HOME/remote-juggler/pinentry.log`, defaulting to
/// `~/.cache/remote-juggler/pinentry.log`.
fn log_path(xdg_cache: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    let base = match xdg_cache.filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(home?).join(".cache"),
    };
    Some(base.join("remote-juggler").join("pinentry.log"))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    rotate(path)?;
    OpenOptions::new().create(true).append(true).open(path)
}

/// Shift `path` to `path.1` (and older generations up by one) once it has
/// grown past the size limit. The oldest generation is discarded.
fn rotate(path: &Path) -> io::Result<()> {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if size <= MAX_LOG_BYTES {
        return Ok(());
    }
    for n in (1..GENERATIONS).rev() {
        let older = generation(path, n);
        if older.exists() {
            std::fs::rename(&older, generation(path, n + 1))?;
        }
    }
    std::fs::rename(path, generation(path, 1))
}

fn generation(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
