// hdbimport command-line entry point.
// Subcommands: import (reconcile + insert every table), generate (write INSERT
// scripts), execute (run scripts through the client) and ping.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use hdbimport::client::{HdbClient, SqlClient};
use hdbimport::config::{Config, RawConfig};
use hdbimport::generate::{GenerateSettings, Generator};
use hdbimport::importer::{ImportSettings, Importer, RunSummary};
use hdbimport::logger;
use hdbimport::progress::ProgressManager;
use hdbimport::script::{list_scripts, ScriptRunSummary, ScriptRunner, ScriptSettings};
use hdbimport::source::{resolve_schema_name, ExportSource, TableEntry};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{debug, warn};

// Command-line flags and subcommands.
#[derive(Parser, Debug)]
#[command(author, version, about, arg_required_else_help = true)]
struct Cli {
    /// Enable debug logging (disables progress bars).
    #[arg(long, global = true)]
    debug: bool,

    /// Disable progress bars.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Config file in KEY=value form (default: ./hana_config.conf if present).
    #[arg(long, global = true, env = "HDBIMPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Also write log output to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import every table of the export, skipping rows already present.
    Import(ImportArgs),
    /// Write one INSERT script per table of the export.
    Generate(GenerateArgs),
    /// Execute one SQL script, or every script in the SQL directory.
    Execute(ExecuteArgs),
    /// Check that the database answers.
    Ping,
}

// Where the export lives and which tables to touch.
#[derive(Args, Debug)]
struct ExportArgs {
    /// Export archive (.tar.gz).
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Directory holding (or receiving) the extracted export.
    #[arg(long)]
    extract_dir: Option<PathBuf>,

    /// Source schema inside the export (detected when omitted).
    #[arg(long)]
    schema: Option<String>,

    /// Schema owning the target tables (derived from the user when omitted).
    #[arg(long)]
    target_schema: Option<String>,

    /// Prefix of target table names.
    #[arg(long)]
    table_prefix: Option<String>,

    /// Only process these source tables (repeatable).
    #[arg(long = "table")]
    tables: Vec<String>,
}

impl ExportArgs {
    fn apply(&self, raw: &mut RawConfig) {
        raw.set_override("EXPORT_TAR_FILE", path_string(&self.archive));
        raw.set_override("EXTRACT_DIR", path_string(&self.extract_dir));
        raw.set_override("SCHEMA", self.schema.clone());
        raw.set_override("TARGET_SCHEMA", self.target_schema.clone());
        raw.set_override("TABLE_PREFIX", self.table_prefix.clone());
    }
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[command(flatten)]
    export: ExportArgs,

    /// Directory for per-table error files.
    #[arg(long)]
    error_dir: Option<PathBuf>,

    /// Rows fetched per reconciliation page.
    #[arg(long)]
    page_size: Option<usize>,

    /// Concurrent page comparisons.
    #[arg(long)]
    compare_workers: Option<usize>,

    /// Concurrent row inserts.
    #[arg(long)]
    insert_workers: Option<usize>,

    /// Write the run summary and per-table timings as JSON.
    #[arg(long)]
    timing_json: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    export: ExportArgs,

    /// Output directory for the scripts.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Do not consult the database; emit every CSV row.
    #[arg(long)]
    offline: bool,
}

#[derive(Args, Debug)]
struct ExecuteArgs {
    /// Script to execute (default: every *.sql in the SQL directory).
    file: Option<PathBuf>,

    /// Directory of scripts.
    #[arg(long)]
    sql_dir: Option<PathBuf>,

    /// Schema used to qualify unqualified target tables.
    #[arg(long)]
    target_schema: Option<String>,
}

fn main() -> Result<ExitCode> {
    let wall_start = Instant::now();
    let cli = Cli::parse();

    let _log_guard =
        logger::init(cli.debug, cli.log_file.as_deref()).context("cannot open log file")?;
    debug!("main: starting {:?}", cli.command);

    // Progress bars are disabled in debug mode to avoid mangled output.
    let progress = ProgressManager::new(!cli.debug && !cli.no_progress);

    let mut raw = RawConfig::load(cli.config.as_deref())?;
    if let Some(path) = raw.source() {
        debug!("main: config file {}", path.display());
    }

    let ok = match cli.command {
        Command::Import(args) => {
            args.export.apply(&mut raw);
            raw.set_override("ERROR_LOG_DIR", path_string(&args.error_dir));
            raw.set_override("PAGE_SIZE", args.page_size.map(|v| v.to_string()));
            raw.set_override("COMPARE_WORKERS", args.compare_workers.map(|v| v.to_string()));
            raw.set_override("INSERT_WORKERS", args.insert_workers.map(|v| v.to_string()));
            let config = Config::resolve(&raw)?;
            cmd_import(&config, &args, progress)?
        }
        Command::Generate(args) => {
            args.export.apply(&mut raw);
            raw.set_override("SQL_DIR", path_string(&args.output_dir));
            let config = Config::resolve(&raw)?;
            cmd_generate(&config, &args, progress)?
        }
        Command::Execute(args) => {
            raw.set_override("SQL_DIR", path_string(&args.sql_dir));
            raw.set_override("TARGET_SCHEMA", args.target_schema.clone());
            let config = Config::resolve(&raw)?;
            cmd_execute(&config, &args, progress)?
        }
        Command::Ping => {
            let config = Config::resolve(&raw)?;
            cmd_ping(&config)?
        }
    };

    debug!("main: finished in {:?}", wall_start.elapsed());
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn cmd_import(config: &Config, args: &ImportArgs, progress: ProgressManager) -> Result<bool> {
    let client = connect(config)?;
    let target_schema = config
        .target_schema()
        .context("cannot determine the target schema; set TARGET_SCHEMA")?;

    let (source, schema, entries) = open_export(config, &args.export.tables)?;
    eprintln!(
        "Importing {} tables from schema {} into {}",
        entries.len(),
        style(&schema).bold(),
        style(&target_schema).bold()
    );
    source
        .ensure_extracted(&schema)
        .context("failed to extract the export")?;

    let settings = ImportSettings {
        target_schema,
        table_prefix: config.table_prefix.clone(),
        error_log_dir: config.error_log_dir.clone(),
        tunables: config.tunables,
        sql_timeout: config.sql_timeout,
    };
    let importer = Importer::new(&client, settings, progress);
    let summary = importer.run(&source, &entries);

    if logger::is_debug() {
        debug!("Timing: top 10 slowest tables (ms):");
        for t in summary.slowest(10) {
            debug!(
                "  {} total={} load={} reconcile={} insert={}",
                t.table,
                t.total_ms(),
                t.load_ms,
                t.reconcile_ms,
                t.insert_ms
            );
        }
    }
    report_import(
        &mut io::stderr(),
        &summary,
        &config.error_log_dir,
        args.timing_json.as_deref(),
    )?;
    Ok(summary.is_success())
}

fn cmd_generate(config: &Config, args: &GenerateArgs, progress: ProgressManager) -> Result<bool> {
    // The database is optional here: without it every CSV row is emitted.
    let client = if args.offline || !config.has_connection() {
        None
    } else {
        match HdbClient::from_config(config) {
            Ok(c) => match c.ping() {
                Ok(()) => Some(c),
                Err(e) => {
                    warn!("Database not reachable, generating without filtering: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("{}; generating without filtering", e);
                None
            }
        }
    };

    let (source, schema, entries) = open_export(config, &args.export.tables)?;
    source
        .ensure_extracted(&schema)
        .context("failed to extract the export")?;

    let settings = GenerateSettings {
        output_dir: config.sql_dir.clone(),
        table_prefix: config.table_prefix.clone(),
        target_schema: config.target_schema(),
        tunables: config.tunables,
    };
    let generator = Generator::new(client.as_ref(), settings, progress);
    let summary = generator.run(&source, &entries);

    let sep = "=".repeat(60);
    let mut stderr = io::stderr();
    writeln!(stderr, "\n{}\nSUMMARY\n{}", sep, sep)?;
    writeln!(stderr, "Scripts written:  {}", summary.tables_written)?;
    writeln!(stderr, "Tables failed:    {}", summary.tables_failed)?;
    writeln!(stderr, "Rows generated:   {}", summary.rows_generated)?;
    writeln!(stderr, "Rows skipped:     {}", summary.rows_skipped)?;
    writeln!(stderr, "Output directory: {}", config.sql_dir.display())?;
    writeln!(stderr, "{}", sep)?;
    Ok(summary.is_success())
}

fn cmd_execute(config: &Config, args: &ExecuteArgs, progress: ProgressManager) -> Result<bool> {
    let (files, single) = match &args.file {
        Some(file) => {
            if !file.is_file() {
                bail!("file not found: {}", file.display());
            }
            (vec![file.clone()], true)
        }
        None => {
            let files = list_scripts(&config.sql_dir)
                .with_context(|| format!("cannot read {}", config.sql_dir.display()))?;
            (files, false)
        }
    };
    if files.is_empty() {
        bail!("no .sql files found in {}", config.sql_dir.display());
    }

    let client = connect(config)?;
    let settings = ScriptSettings {
        target_schema: config.target_schema(),
        table_prefix: config.table_prefix.clone(),
        log_dir: config.log_dir.clone(),
        created_dir: config.created_dir.clone(),
        timeout: config.sql_timeout,
        poll_interval: config.tunables.poll_interval,
    };
    let runner = ScriptRunner::new(&client, settings, progress);
    let summary = runner.run(&files, single)?;
    print_script_summary(&summary, files.len(), config)?;
    Ok(summary.is_success())
}

fn cmd_ping(config: &Config) -> Result<bool> {
    let client = HdbClient::from_config(config)?;
    print_connection(&client);
    match client.ping() {
        Ok(()) => {
            eprintln!("{} connection OK", style("✓").green());
            Ok(true)
        }
        Err(e) => {
            eprintln!("{} {}", style("✗").red(), style(e).red());
            Ok(false)
        }
    }
}

// Locate the client and make sure the database answers before any work.
fn connect(config: &Config) -> Result<HdbClient> {
    let client = HdbClient::from_config(config)?;
    print_connection(&client);
    client.ping().context("database is not reachable")?;
    Ok(client)
}

fn print_connection(client: &HdbClient) {
    let params = client.params();
    eprintln!("Server:   {}", params.endpoint());
    if let Some(db) = &params.database {
        eprintln!("Database: {}", db);
    }
    eprintln!("User:     {}", params.user);
    eprintln!("Client:   {}", client.binary().display());
}

fn open_export(
    config: &Config,
    only: &[String],
) -> Result<(ExportSource, String, Vec<TableEntry>)> {
    let source = ExportSource::open(&config.export_archive, &config.extract_dir)?;
    let schema = resolve_schema_name(config.source_schema.as_deref(), &source)?;
    let mut entries = source.tables(&schema)?;
    if !only.is_empty() {
        entries.retain(|e| only.iter().any(|t| t.eq_ignore_ascii_case(&e.table)));
    }
    if entries.is_empty() {
        bail!("no tables found for schema {}", schema);
    }
    Ok((source, schema, entries))
}

// The summary is always printed; the timing file comes after it.
fn report_import(
    out: &mut impl Write,
    summary: &RunSummary,
    error_dir: &Path,
    timing_json: Option<&Path>,
) -> Result<()> {
    print_import_summary(out, summary, error_dir)?;
    if let Some(path) = timing_json {
        summary
            .write_json(path)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }
    Ok(())
}

fn print_import_summary(
    stderr: &mut impl Write,
    summary: &RunSummary,
    error_dir: &Path,
) -> io::Result<()> {
    let sep = "=".repeat(60);
    writeln!(stderr, "\n{}\nSUMMARY\n{}", sep, sep)?;
    writeln!(
        stderr,
        "Tables:    {} succeeded, {} failed, {} total",
        summary.tables_succeeded, summary.tables_failed, summary.tables_total
    )?;
    writeln!(stderr, "Inserted:  {}", summary.rows_inserted)?;
    writeln!(stderr, "Skipped:   {}", summary.rows_skipped)?;
    writeln!(stderr, "Failed:    {}", summary.rows_failed)?;
    writeln!(
        stderr,
        "Elapsed:   {:.1}s ({:.0} rows/s)",
        summary.elapsed_ms as f64 / 1000.0,
        summary.rows_per_second()
    )?;
    if !summary.failed_tables.is_empty() {
        writeln!(
            stderr,
            "{} {}",
            style("Failed tables:").red(),
            summary.failed_tables.join(", ")
        )?;
        writeln!(stderr, "Error files in {}", error_dir.display())?;
    }
    writeln!(stderr, "{}", sep)?;
    Ok(())
}

fn print_script_summary(
    summary: &ScriptRunSummary,
    total: usize,
    config: &Config,
) -> io::Result<()> {
    let sep = "=".repeat(60);
    let mut stderr = io::stderr();
    writeln!(stderr, "\n{}\nSUMMARY\n{}", sep, sep)?;
    writeln!(stderr, "Files:     {}", total)?;
    writeln!(stderr, "Succeeded: {}", summary.succeeded)?;
    writeln!(stderr, "Failed:    {}", summary.failed)?;
    writeln!(stderr, "Skipped:   {}", summary.skipped)?;
    writeln!(stderr, "Logs in {}", config.log_dir.display())?;
    writeln!(stderr, "{}", sep)?;
    Ok(())
}

fn path_string(p: &Option<PathBuf>) -> Option<String> {
    p.as_ref().map(|p| p.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_run() -> RunSummary {
        RunSummary {
            tables_total: 2,
            tables_succeeded: 1,
            tables_failed: 1,
            rows_inserted: 5,
            rows_failed: 1,
            failed_tables: vec!["ORDERS".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn summary_is_printed_even_if_timing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let unwritable = dir.path().join("missing").join("timing.json");
        let mut out = Vec::new();

        let res = report_import(
            &mut out,
            &failed_run(),
            Path::new("error_logs"),
            Some(unwritable.as_path()),
        );
        assert!(res.is_err());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("SUMMARY"));
        assert!(text.contains("1 succeeded, 1 failed, 2 total"));
        assert!(text.contains("ORDERS"));
    }

    #[test]
    fn timing_file_written_after_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timing.json");
        let mut out = Vec::new();
        report_import(&mut out, &failed_run(), dir.path(), Some(path.as_path())).unwrap();
        assert!(path.is_file());
        assert!(!out.is_empty());
    }

    #[test]
    fn cli_parses_import_flags() {
        let cli = Cli::try_parse_from([
            "hdbimport",
            "import",
            "--table",
            "A",
            "--table",
            "B",
            "--page-size",
            "50",
        ])
        .unwrap();
        match cli.command {
            Command::Import(args) => {
                assert_eq!(args.export.tables, vec!["A", "B"]);
                assert_eq!(args.page_size, Some(50));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
