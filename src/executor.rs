// Parallel insert executor: one INSERT per pending row on a fixed-size pool.
// Rows are independent; a failure is recorded and the rest keep going.

use crate::client::{ClientOutput, SqlClient};
use crate::error::{ClientError, ImportError};
use crate::parser::{render_insert, TargetTable};
use crate::reconcile::PendingRowSet;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub row_ordinal: usize,
    pub message: String,
}

/// Per-table counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub failed: Vec<RowFailure>,
}

impl ImportOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn processed(&self) -> usize {
        self.inserted + self.skipped_duplicate + self.failed.len()
    }
}

/// Classification of one row's insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertStatus {
    Inserted,
    Duplicate,
    Failed(String),
}

/// A uniqueness violation reported by the client. Matched on text because the
/// client exposes no error codes on its error stream.
pub fn is_duplicate_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("unique constraint") || lower.contains("duplicate")
}

pub fn classify(result: Result<ClientOutput, ClientError>) -> InsertStatus {
    match result {
        Ok(out) if out.success() => InsertStatus::Inserted,
        Ok(out) if is_duplicate_error(&out.stderr) => InsertStatus::Duplicate,
        Ok(out) => {
            let msg = out.stderr.trim();
            if msg.is_empty() {
                InsertStatus::Failed("unknown error".to_string())
            } else {
                InsertStatus::Failed(msg.to_string())
            }
        }
        Err(e) => InsertStatus::Failed(e.to_string()),
    }
}

fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Insert every pending row into `target` using `workers` threads.
///
/// The returned outcome covers this phase only: `processed()` always equals
/// `pending.len()`. Failures are sorted by row ordinal.
pub fn execute_inserts<C: SqlClient + ?Sized>(
    client: &C,
    target: &TargetTable,
    columns: &[String],
    pending: &PendingRowSet,
    workers: usize,
    timeout: Option<Duration>,
) -> Result<ImportOutcome, ImportError> {
    if pending.is_empty() {
        return Ok(ImportOutcome::default());
    }
    let rows = pending.rows_in_order();
    debug!(
        "ExecuteInserts: {} rows into {} on {} workers",
        rows.len(),
        target,
        workers
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("insert-{}", i))
        .build()?;

    let outcome = Mutex::new(ImportOutcome::default());
    pool.install(|| {
        rows.par_iter().for_each(|row| {
            let stmt = render_insert(target, columns, &row.values);
            let status = classify(client.execute(&stmt, timeout));
            let mut guard = lock_or_recover(&outcome);
            match status {
                InsertStatus::Inserted => guard.inserted += 1,
                InsertStatus::Duplicate => guard.skipped_duplicate += 1,
                InsertStatus::Failed(message) => {
                    debug!("ExecuteInserts: row {} failed: {}", row.ordinal, message);
                    guard.failed.push(RowFailure {
                        row_ordinal: row.ordinal,
                        message,
                    });
                }
            }
        });
    });

    let mut outcome = match outcome.into_inner() {
        Ok(o) => o,
        Err(poisoned) => poisoned.into_inner(),
    };
    outcome.failed.sort_by_key(|f| f.row_ordinal);
    if !outcome.failed.is_empty() {
        warn!(
            "{} of {} rows failed for {}",
            outcome.failed.len(),
            rows.len(),
            target
        );
    }
    Ok(outcome)
}

/// Write `<dir>/<table>.err` listing every failed row. Nothing is written when
/// there are no failures.
pub fn write_error_artifact(
    dir: &Path,
    table: &str,
    failures: &[RowFailure],
) -> std::io::Result<Option<PathBuf>> {
    if failures.is_empty() {
        return Ok(None);
    }
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.err", table));
    let mut file = fs::File::create(&path)?;
    writeln!(file, "Errors inserting into table {}:", table)?;
    writeln!(file)?;
    for f in failures {
        writeln!(file, "Row {}: {}", f.row_ordinal, f.message)?;
    }
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(code: i32, stderr: &str) -> Result<ClientOutput, ClientError> {
        Ok(ClientOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[test]
    fn classification() {
        assert_eq!(classify(out(0, "")), InsertStatus::Inserted);
        assert_eq!(
            classify(out(1, "* 301: unique constraint violated: Table(DB_T)")),
            InsertStatus::Duplicate
        );
        assert_eq!(classify(out(1, "Duplicate key")), InsertStatus::Duplicate);
        assert_eq!(
            classify(out(1, "  * 339: invalid number  ")),
            InsertStatus::Failed("* 339: invalid number".to_string())
        );
        assert_eq!(
            classify(out(2, "")),
            InsertStatus::Failed("unknown error".to_string())
        );
        match classify(Err(ClientError::Timeout(Duration::from_secs(3)))) {
            InsertStatus::Failed(msg) => assert!(msg.contains("timeout")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_artifact_lists_rows() {
        let dir = tempfile::tempdir().unwrap();
        let failures = vec![
            RowFailure {
                row_ordinal: 2,
                message: "bad value".to_string(),
            },
            RowFailure {
                row_ordinal: 7,
                message: "too long".to_string(),
            },
        ];
        let path = write_error_artifact(&dir.path().join("errs"), "ORDERS", &failures)
            .unwrap()
            .unwrap();
        assert!(path.ends_with("errs/ORDERS.err"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("Errors inserting into table ORDERS:"));
        assert!(text.contains("Row 2: bad value\nRow 7: too long\n"));

        assert_eq!(write_error_artifact(dir.path(), "EMPTY", &[]).unwrap(), None);
        assert!(!dir.path().join("EMPTY.err").exists());
    }
}
