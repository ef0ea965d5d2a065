// Logging setup: tracing to stderr, optionally mirrored to a log file.
// The debug flag is also kept globally so progress bars can stay out of the
// way of debug output. While bars are drawing, stderr lines are written with
// the bars suspended.

use indicatif::MultiProgress;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static DEBUG: AtomicBool = AtomicBool::new(false);
static BARS: RwLock<Option<MultiProgress>> = RwLock::new(None);

fn bars() -> RwLockReadGuard<'static, Option<MultiProgress>> {
    match BARS.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn bars_mut() -> RwLockWriteGuard<'static, Option<MultiProgress>> {
    match BARS.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Route stderr log lines around these bars (None detaches).
pub fn attach_progress(multi: Option<MultiProgress>) {
    *bars_mut() = multi;
}

pub fn progress_attached() -> bool {
    bars().is_some()
}

// Stderr writer for the fmt layer. Each formatted event arrives as one write.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarAwareStderr;

impl Write for BarAwareStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let guard = bars();
        match guard.as_ref() {
            Some(mp) => mp.suspend(|| io::stderr().write_all(buf)).map(|()| buf.len()),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

// Returns true if debug logging is enabled.
pub fn is_debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

// Install the global subscriber. RUST_LOG wins over the --debug flag.
// Keep the returned guard alive for the whole run or file output is lost.
pub fn init(debug: bool, log_file: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    DEBUG.store(debug, Ordering::Relaxed);

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hdbimport={}", default_level)));

    let stderr_layer = fmt::layer()
        .with_writer(|| BarAwareStderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => std::path::PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "hdbimport.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests) is not an error worth reporting.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::{ProgressBar, ProgressDrawTarget};

    #[test]
    fn stderr_writes_go_through_attached_bars() {
        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let bar = mp.add(ProgressBar::new(10));
        attach_progress(Some(mp));
        assert!(progress_attached());

        let line = b"WARN page fetch failed\n";
        assert_eq!(BarAwareStderr.write(line).unwrap(), line.len());
        bar.inc(1);

        attach_progress(None);
        assert!(!progress_attached());
        assert_eq!(BarAwareStderr.write(b"").unwrap(), 0);
    }
}
