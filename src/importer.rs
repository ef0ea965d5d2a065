// Import pipeline: per table, parse the DDL, key the CSV rows, reconcile them
// against the live table and insert what is left. Tables run one after
// another; the phases inside a table run on their own pools.

use crate::client::SqlClient;
use crate::config::Tunables;
use crate::error::ImportError;
use crate::executor::{execute_inserts, write_error_artifact, ImportOutcome};
use crate::parser::{SchemaParser, TableSpec, TargetTable};
use crate::progress::{ProgressManager, ProgressMonitor};
use crate::reconcile::{load_pending, reconcile, KeyShape, PendingRowSet, ReconcileReport};
use crate::source::{ExportSource, TableEntry};
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything the pipeline needs besides the client.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub target_schema: String,
    pub table_prefix: String,
    pub error_log_dir: PathBuf,
    pub tunables: Tunables,
    pub sql_timeout: Option<Duration>,
}

// Per-table timing data for profiling slow tables.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TableTiming {
    pub table: String,
    pub load_ms: u128,
    pub reconcile_ms: u128,
    pub insert_ms: u128,
}

impl TableTiming {
    pub fn total_ms(&self) -> u128 {
        self.load_ms + self.reconcile_ms + self.insert_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TableReport {
    pub table: String,
    pub target: TargetTable,
    pub status: TableStatus,
    pub outcome: ImportOutcome,
    pub reconcile: ReconcileReport,
    pub error_file: Option<PathBuf>,
    pub timing: TableTiming,
}

impl TableReport {
    fn failed(table: &str, target: TargetTable, reason: String, timing: TableTiming) -> Self {
        Self {
            table: table.to_string(),
            target,
            status: TableStatus::Failed(reason),
            outcome: ImportOutcome::default(),
            reconcile: ReconcileReport::default(),
            error_file: None,
            timing,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TableStatus::Succeeded
    }
}

/// Totals over one run; serialised for `--timing-json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub tables_total: usize,
    pub tables_succeeded: usize,
    pub tables_failed: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub rows_failed: usize,
    pub elapsed_ms: u128,
    pub failed_tables: Vec<String>,
    pub tables: Vec<TableTiming>,
}

impl RunSummary {
    pub fn record(&mut self, report: &TableReport) {
        self.tables_total += 1;
        if report.is_success() {
            self.tables_succeeded += 1;
        } else {
            self.tables_failed += 1;
            self.failed_tables.push(report.table.clone());
        }
        self.rows_inserted += report.outcome.inserted;
        self.rows_skipped += report.outcome.skipped_duplicate;
        self.rows_failed += report.outcome.failed.len();
        self.tables.push(report.timing.clone());
    }

    pub fn is_success(&self) -> bool {
        self.tables_failed == 0
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.elapsed_ms as f64 / 1000.0;
        if secs > 0.0 {
            self.rows_inserted as f64 / secs
        } else {
            0.0
        }
    }

    /// Slowest tables first.
    pub fn slowest(&self, n: usize) -> Vec<&TableTiming> {
        let mut rows: Vec<&TableTiming> = self.tables.iter().collect();
        rows.sort_by(|a, b| b.total_ms().cmp(&a.total_ms()));
        rows.truncate(n);
        rows
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ImportError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

pub struct Importer<'a, C: SqlClient + ?Sized> {
    client: &'a C,
    settings: ImportSettings,
    progress: ProgressManager,
    parser: SchemaParser,
}

impl<'a, C: SqlClient + ?Sized> Importer<'a, C> {
    pub fn new(client: &'a C, settings: ImportSettings, progress: ProgressManager) -> Self {
        Self {
            client,
            settings,
            progress,
            parser: SchemaParser::new(),
        }
    }

    pub fn target_for(&self, table: &str) -> TargetTable {
        TargetTable::qualified(
            &self.settings.target_schema,
            format!("{}{}", self.settings.table_prefix, table),
        )
    }

    /// Import every listed table in order and summarise.
    pub fn run(&self, source: &ExportSource, entries: &[TableEntry]) -> RunSummary {
        let start = Instant::now();
        let mut summary = RunSummary::default();
        let total = entries.len();
        let tables_bar = self.progress.new_table_bar("Tables", total as u64);

        for (i, entry) in entries.iter().enumerate() {
            let report = match (source.read(&entry.ddl_path()), source.read(&entry.data_path())) {
                (Some(ddl), Some(csv_text)) => self.import_table(&entry.table, &ddl, &csv_text),
                (ddl, _) => {
                    let missing = if ddl.is_none() {
                        entry.ddl_path()
                    } else {
                        entry.data_path()
                    };
                    let err = ImportError::MissingExportFile(missing);
                    warn!("Skipping {}: {}", entry.table, err);
                    TableReport::failed(
                        &entry.table,
                        self.target_for(&entry.table),
                        err.to_string(),
                        TableTiming {
                            table: entry.table.clone(),
                            ..Default::default()
                        },
                    )
                }
            };
            self.progress
                .println(&format_table_line(i + 1, total, &report));
            summary.record(&report);
            if let Some(bar) = &tables_bar {
                bar.inc(1);
            }
        }

        if let Some(bar) = &tables_bar {
            bar.finish();
        }
        summary.elapsed_ms = start.elapsed().as_millis();
        summary
    }

    /// Run the whole pipeline for one table. Never fails the run: every
    /// problem ends up in the report.
    pub fn import_table(&self, table: &str, ddl: &str, csv_text: &str) -> TableReport {
        let target = self.target_for(table);
        let mut timing = TableTiming {
            table: table.to_string(),
            ..Default::default()
        };

        let load_start = Instant::now();
        let spec = match self.parser.parse_table(table, ddl) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping {}: {}", table, e);
                return TableReport::failed(table, target, e.to_string(), timing);
            }
        };
        let shape = KeyShape::for_table(&spec);
        if spec.primary_key.is_some() && !shape.is_primary_key() {
            info!("{}: primary key not among parsed columns, matching on full rows", table);
        }
        let pending = match load_pending(&spec, &shape, csv_text) {
            Ok(p) => p,
            Err(e) => {
                warn!("Skipping {}: unreadable CSV: {}", table, e);
                return TableReport::failed(table, target, format!("CSV error: {}", e), timing);
            }
        };
        timing.load_ms = load_start.elapsed().as_millis();
        let csv_rows = pending.len();

        match self.import_rows(&target, &spec, &shape, pending, &mut timing) {
            Ok((outcome, reconcile)) => {
                let error_file = match write_error_artifact(
                    &self.settings.error_log_dir,
                    table,
                    &outcome.failed,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Could not write error file for {}: {}", table, e);
                        None
                    }
                };
                let status = if outcome.is_success() {
                    TableStatus::Succeeded
                } else {
                    TableStatus::Failed(format!("{} rows failed", outcome.failed.len()))
                };
                debug!(
                    "ImportTable: {} rows={} inserted={} skipped={} failed={} timing={}ms",
                    table,
                    csv_rows,
                    outcome.inserted,
                    outcome.skipped_duplicate,
                    outcome.failed.len(),
                    timing.total_ms()
                );
                TableReport {
                    table: table.to_string(),
                    target,
                    status,
                    outcome,
                    reconcile,
                    error_file,
                    timing,
                }
            }
            Err(e) => {
                warn!("Import of {} aborted: {}", table, e);
                TableReport::failed(table, target, e.to_string(), timing)
            }
        }
    }

    fn import_rows(
        &self,
        target: &TargetTable,
        spec: &TableSpec,
        shape: &KeyShape,
        pending: PendingRowSet,
        timing: &mut TableTiming,
    ) -> Result<(ImportOutcome, ReconcileReport), ImportError> {
        let tunables = &self.settings.tunables;

        let reconcile_start = Instant::now();
        let page_bar = self.progress.new_page_bar(&format!("Compare {}", spec.name));
        let (pending, report) = reconcile(
            self.client,
            target,
            spec,
            shape,
            pending,
            tunables,
            page_bar.as_ref(),
        )?;
        if let Some(bar) = &page_bar {
            bar.finish_and_clear();
        }
        timing.reconcile_ms = reconcile_start.elapsed().as_millis();

        let insert_start = Instant::now();
        let mut outcome = if pending.is_empty() {
            debug!("ImportRows: nothing new for {}", target);
            ImportOutcome::default()
        } else {
            let baseline = report
                .live_count
                .or_else(|| self.client.count_rows(target))
                .unwrap_or(0);
            let insert_bar = self
                .progress
                .new_insert_bar(&format!("Insert {}", spec.name), pending.len() as u64);
            let columns = spec.column_names();
            let monitor = ProgressMonitor::new(
                self.client,
                target,
                baseline,
                pending.len() as u64,
                tunables.poll_interval,
            )
            .with_bar(insert_bar);
            let (outcome, last) = monitor.run(|| {
                execute_inserts(
                    self.client,
                    target,
                    &columns,
                    &pending,
                    tunables.insert_workers,
                    self.settings.sql_timeout,
                )
            });
            if let Some(c) = last {
                debug!("ImportRows: {} holds {} rows after insert", target, c);
            }
            outcome?
        };
        timing.insert_ms = insert_start.elapsed().as_millis();

        outcome.skipped_duplicate += report.duplicates;
        Ok((outcome, report))
    }
}

fn format_table_line(index: usize, total: usize, report: &TableReport) -> String {
    let head = format!("[{}/{}] {}", index, total, report.table);
    match &report.status {
        TableStatus::Succeeded => format!(
            "{} {} {} inserted, {} skipped",
            style("✓").green(),
            head,
            report.outcome.inserted,
            report.outcome.skipped_duplicate
        ),
        TableStatus::Failed(reason) => {
            let mut line = format!(
                "{} {} {} inserted, {} skipped, {}",
                style("✗").red(),
                head,
                report.outcome.inserted,
                report.outcome.skipped_duplicate,
                style(reason).red()
            );
            if let Some(path) = &report.error_file {
                line.push_str(&format!(" (see {})", path.display()));
            }
            line
        }
    }
}
