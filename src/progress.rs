// Progress reporting using indicatif.
// All bars live under one MultiProgress so they render on separate lines; the
// insert phase is tracked by polling the target's live row count.

use crate::client::SqlClient;
use crate::parser::TargetTable;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ProgressManager {
    multi: Option<Arc<MultiProgress>>,
}

impl ProgressManager {
    // Create a new manager. If enabled=false, no bars are created.
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            let mp = MultiProgress::new();
            crate::logger::attach_progress(Some(mp.clone()));
            Some(Arc::new(mp))
        } else {
            None
        };
        Self { multi }
    }

    pub fn is_enabled(&self) -> bool {
        self.multi.is_some()
    }

    // Overall bar across tables (or script files).
    pub fn new_table_bar(&self, label: &str, total: u64) -> Option<ProgressBar> {
        self.add_bar(label, total, count_style())
    }

    // Reconciliation pages of one table. Length is set once the count is known.
    pub fn new_page_bar(&self, label: &str) -> Option<ProgressBar> {
        self.add_bar(label, 0, count_style())
    }

    // Rows landed in the target during the insert phase.
    pub fn new_insert_bar(&self, label: &str, total: u64) -> Option<ProgressBar> {
        self.add_bar(label, total, insert_style())
    }

    // Print a line above the bars (plain stderr when bars are off).
    pub fn println(&self, msg: &str) {
        match &self.multi {
            Some(mp) => {
                if mp.println(msg).is_err() {
                    eprintln!("{}", msg);
                }
            }
            None => eprintln!("{}", msg),
        }
    }

    fn add_bar(&self, label: &str, total: u64, style: ProgressStyle) -> Option<ProgressBar> {
        let mp = self.multi.as_ref()?;
        let bar = mp.add(ProgressBar::new(total));
        bar.set_style(style);
        bar.set_prefix(label.to_string());
        Some(bar)
    }
}

fn count_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:24} {pos:>6}/{len:<6} [{bar:50}] {percent:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█ ")
}

fn insert_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:24} [{bar:50}] {msg} {elapsed}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█ ")
}

/// `inserted/total (pct%)` from a live count and the pre-insert baseline.
pub fn format_progress(current: u64, baseline: u64, total: u64) -> String {
    if total == 0 {
        return format!("{} rows in table", current);
    }
    let inserted = current.saturating_sub(baseline);
    let percent = (inserted as f64 / total as f64 * 100.0).min(100.0);
    format!("{}/{} inserted ({:.1}%)", inserted, total, percent)
}

/// Polls the target's row count while some work runs.
pub struct ProgressMonitor<'a, C: SqlClient + ?Sized> {
    client: &'a C,
    target: &'a TargetTable,
    baseline: u64,
    total: u64,
    interval: Duration,
    bar: Option<ProgressBar>,
}

impl<'a, C: SqlClient + ?Sized> ProgressMonitor<'a, C> {
    pub fn new(
        client: &'a C,
        target: &'a TargetTable,
        baseline: u64,
        total: u64,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            target,
            baseline,
            total,
            interval,
            bar: None,
        }
    }

    pub fn with_bar(mut self, bar: Option<ProgressBar>) -> Self {
        self.bar = bar;
        self
    }

    /// Run `work` on the calling thread while a scoped thread samples the
    /// count. Returns the work's result and the final sample (taken after the
    /// sampler has stopped), which is `None` if that count failed.
    pub fn run<R>(&self, work: impl FnOnce() -> R) -> (R, Option<u64>) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        thread::scope(|s| {
            let sampler = s.spawn(|| self.poll(stop_rx));
            let result = work();
            // Dropping the sender also stops the sampler if `work` unwinds.
            drop(stop_tx);
            if sampler.join().is_err() {
                warn!("ProgressMonitor: sampler for {} panicked", self.target);
            }
            let last = self.sample(None);
            if let Some(bar) = &self.bar {
                bar.finish();
            }
            (result, last)
        })
    }

    fn poll(&self, stop: Receiver<()>) {
        let mut last_seen = None;
        loop {
            if let Some(c) = self.sample(last_seen) {
                last_seen = Some(c);
            }
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    // One count. Failed samples are skipped; the next tick retries.
    fn sample(&self, last_seen: Option<u64>) -> Option<u64> {
        let current = match self.client.count_rows(self.target) {
            Some(c) => c,
            None => {
                debug!("ProgressMonitor: sample of {} failed, retrying", self.target);
                return None;
            }
        };
        if last_seen == Some(current) {
            return Some(current);
        }
        let msg = format_progress(current, self.baseline, self.total);
        match &self.bar {
            Some(bar) => {
                bar.set_position(current.saturating_sub(self.baseline).min(self.total));
                bar.set_message(msg);
            }
            None => debug!("Progress {}: {}", self.target, msg),
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOutput;
    use crate::error::ClientError;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    // Reports a growing count; every third sample fails.
    struct Counting {
        rows: AtomicU64,
        calls: AtomicUsize,
    }

    impl SqlClient for Counting {
        fn execute(&self, _: &str, _: Option<Duration>) -> Result<ClientOutput, ClientError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 3 == 2 {
                return Err(ClientError::Timeout(Duration::from_secs(1)));
            }
            Ok(ClientOutput {
                exit_code: 0,
                stdout: format!("COUNT(*)\n{}\n", self.rows.load(Ordering::SeqCst)),
                stderr: String::new(),
            })
        }

        fn execute_file(
            &self,
            path: &Path,
            _: Option<Duration>,
        ) -> Result<ClientOutput, ClientError> {
            Err(ClientError::MissingFile(path.to_path_buf()))
        }
    }

    #[test]
    fn formats_delta_against_baseline() {
        assert_eq!(format_progress(15, 10, 10), "5/10 inserted (50.0%)");
        assert_eq!(format_progress(40, 10, 10), "30/10 inserted (100.0%)");
        assert_eq!(format_progress(5, 10, 10), "0/10 inserted (0.0%)");
        assert_eq!(format_progress(7, 0, 0), "7 rows in table");
    }

    #[test]
    fn final_sample_sees_completed_work() {
        let client = Counting {
            rows: AtomicU64::new(100),
            calls: AtomicUsize::new(0),
        };
        let target = TargetTable::qualified("S", "T");
        let monitor = ProgressMonitor::new(&client, &target, 100, 5, Duration::from_millis(5));
        let (value, last) = monitor.run(|| {
            for _ in 0..5 {
                client.rows.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
            }
            "done"
        });
        assert_eq!(value, "done");
        // The final sample may land on a failing call; retrying is the caller's
        // choice, so accept either outcome but never a stale value.
        if let Some(c) = last {
            assert_eq!(c, 105);
        }
        assert!(client.calls.load(Ordering::SeqCst) >= 2);
    }
}
