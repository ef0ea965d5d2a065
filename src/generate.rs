// SQL script generation: one `<table>.sql` of INSERT statements per export
// table. When a client is available the rows already in the target are
// filtered out with the same reconciliation the importer uses.

use crate::client::SqlClient;
use crate::config::Tunables;
use crate::error::ImportError;
use crate::parser::{render_insert, SchemaParser, TargetTable};
use crate::progress::ProgressManager;
use crate::reconcile::{load_pending, reconcile, KeyShape, PendingRow};
use crate::source::{ExportSource, TableEntry};
use console::style;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct GenerateSettings {
    pub output_dir: PathBuf,
    pub table_prefix: String,
    /// Schema holding the live tables; filtering is skipped without it.
    pub target_schema: Option<String>,
    pub tunables: Tunables,
}

/// Whether the live table was consulted while generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveCheck {
    NotChecked,
    /// Live table was empty or missing.
    Empty,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub table: String,
    pub path: PathBuf,
    pub rows: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerateSummary {
    pub tables_written: usize,
    pub tables_failed: usize,
    pub rows_generated: usize,
    pub rows_skipped: usize,
    pub failed_tables: Vec<String>,
}

impl GenerateSummary {
    pub fn is_success(&self) -> bool {
        self.tables_failed == 0
    }
}

/// Script text: comment header, blank line, one INSERT per row.
pub fn render_script(
    table: &str,
    target: &TargetTable,
    columns: &[String],
    rows: &[&PendingRow],
    check: LiveCheck,
    skipped: usize,
) -> String {
    let mut out = String::new();
    out.push_str("-- Generated INSERT script\n");
    out.push_str(&format!("-- Table: {}\n", target));
    out.push_str(&format!("-- Source CSV: {}.csv\n", table));
    match check {
        LiveCheck::NotChecked => {}
        LiveCheck::Empty => out.push_str("-- Target table checked (empty or missing)\n"),
        LiveCheck::Filtered => out.push_str("-- Existing rows filtered against the target\n"),
    }
    if skipped > 0 {
        out.push_str(&format!("-- Rows skipped (already present): {}\n", skipped));
    }
    out.push('\n');
    for row in rows {
        out.push_str(&render_insert(target, columns, &row.values));
        out.push('\n');
    }
    out
}

pub struct Generator<'a, C: SqlClient + ?Sized> {
    client: Option<&'a C>,
    settings: GenerateSettings,
    progress: ProgressManager,
    parser: SchemaParser,
}

impl<'a, C: SqlClient + ?Sized> Generator<'a, C> {
    pub fn new(client: Option<&'a C>, settings: GenerateSettings, progress: ProgressManager) -> Self {
        Self {
            client,
            settings,
            progress,
            parser: SchemaParser::new(),
        }
    }

    pub fn run(&self, source: &ExportSource, entries: &[TableEntry]) -> GenerateSummary {
        let mut summary = GenerateSummary::default();
        let total = entries.len();
        let bar = self.progress.new_table_bar("Generating", total as u64);

        for (i, entry) in entries.iter().enumerate() {
            let head = format!("[{}/{}] {}", i + 1, total, entry.table);
            let result = match (source.read(&entry.ddl_path()), source.read(&entry.data_path())) {
                (Some(ddl), Some(csv_text)) => self.generate_table(&entry.table, &ddl, &csv_text),
                (None, _) => Err(ImportError::MissingExportFile(entry.ddl_path())),
                (_, None) => Err(ImportError::MissingExportFile(entry.data_path())),
            };
            match result {
                Ok(script) => {
                    summary.tables_written += 1;
                    summary.rows_generated += script.rows;
                    summary.rows_skipped += script.skipped;
                    let mut line = format!(
                        "{} {} {} rows -> {}",
                        style("✓").green(),
                        head,
                        script.rows,
                        script.path.display()
                    );
                    if script.skipped > 0 {
                        line.push_str(&format!(" ({} already present)", script.skipped));
                    }
                    self.progress.println(&line);
                }
                Err(e) => {
                    warn!("Generate {}: {}", entry.table, e);
                    summary.tables_failed += 1;
                    summary.failed_tables.push(entry.table.clone());
                    self.progress
                        .println(&format!("{} {} {}", style("✗").red(), head, style(e).red()));
                }
            }
            if let Some(b) = &bar {
                b.inc(1);
            }
        }
        if let Some(b) = &bar {
            b.finish();
        }
        summary
    }

    /// Write `<output_dir>/<table>.sql` for one table.
    pub fn generate_table(
        &self,
        table: &str,
        ddl: &str,
        csv_text: &str,
    ) -> Result<GeneratedScript, ImportError> {
        let spec = self.parser.parse_table(table, ddl)?;
        let shape = KeyShape::for_table(&spec);
        let pending = load_pending(&spec, &shape, csv_text)?;
        let loaded = pending.len();
        let target_name = format!("{}{}", self.settings.table_prefix, table);

        let (pending, check, skipped) = match (self.client, &self.settings.target_schema) {
            (Some(client), Some(schema)) => {
                let live = TargetTable::qualified(schema, &target_name);
                let (pending, report) = reconcile(
                    client,
                    &live,
                    &spec,
                    &shape,
                    pending,
                    &self.settings.tunables,
                    None,
                )?;
                let check = match report.live_count {
                    Some(n) if n > 0 => LiveCheck::Filtered,
                    _ => LiveCheck::Empty,
                };
                (pending, check, report.duplicates)
            }
            _ => (pending, LiveCheck::NotChecked, 0),
        };

        let rows = pending.rows_in_order();
        let script = render_script(
            table,
            &TargetTable::bare(&target_name),
            &spec.column_names(),
            &rows,
            check,
            skipped,
        );
        fs::create_dir_all(&self.settings.output_dir)?;
        let path = self.settings.output_dir.join(format!("{}.sql", table));
        fs::write(&path, script)?;
        debug!(
            "GenerateTable: {} loaded={} written={} skipped={}",
            table,
            loaded,
            rows.len(),
            skipped
        );
        Ok(GeneratedScript {
            table: table.to_string(),
            path,
            rows: rows.len(),
            skipped,
        })
    }
}
