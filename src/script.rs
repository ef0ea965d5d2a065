// SQL script execution: run generated `.sql` files through the client's batch
// mode, with row counts before and after, per-file output logs and run logs.

use crate::client::{ClientOutput, SqlClient};
use crate::error::{ClientError, ImportError};
use crate::parser::{ScriptParser, TargetTable};
use crate::progress::{ProgressManager, ProgressMonitor};
use chrono::Local;
use console::style;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ERRORS_LOG: &str = "errors.log";
const SUCCESS_LOG: &str = "success.log";
const EXECUTION_LOG: &str = "execution.log";

#[derive(Debug, Clone)]
pub struct ScriptSettings {
    pub target_schema: Option<String>,
    pub table_prefix: String,
    pub log_dir: PathBuf,
    pub created_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStatus {
    Success,
    /// Ran, but the client reported this many uniqueness violations.
    DuplicatesSkipped(usize),
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct ScriptReport {
    pub file: PathBuf,
    pub status: ScriptStatus,
    pub statements: usize,
    pub target: Option<TargetTable>,
    pub records_before: Option<u64>,
    pub records_after: Option<u64>,
    pub duration: Duration,
}

impl ScriptReport {
    fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            status: ScriptStatus::Skipped(String::new()),
            statements: 0,
            target: None,
            records_before: None,
            records_after: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ScriptStatus::Success | ScriptStatus::DuplicatesSkipped(_)
        )
    }

    /// Row count delta, when both counts are known.
    pub fn inserted(&self) -> Option<i64> {
        match (self.records_before, self.records_after) {
            (Some(b), Some(a)) => Some(a as i64 - b as i64),
            _ => None,
        }
    }

    fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.display().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptRunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub moved: Vec<PathBuf>,
}

impl ScriptRunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// `*.sql` files directly inside `dir`, sorted by name.
pub fn list_scripts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();
    Ok(files)
}

/// Occurrences of the client's uniqueness-violation message.
pub fn count_unique_violations(stderr: &str) -> usize {
    stderr.to_lowercase().matches("unique constraint violated").count()
}

pub struct ScriptRunner<'a, C: SqlClient + ?Sized> {
    client: &'a C,
    settings: ScriptSettings,
    progress: ProgressManager,
    parser: ScriptParser,
}

impl<'a, C: SqlClient + ?Sized> ScriptRunner<'a, C> {
    pub fn new(client: &'a C, settings: ScriptSettings, progress: ProgressManager) -> Self {
        Self {
            client,
            settings,
            progress,
            parser: ScriptParser::new(),
        }
    }

    /// Execute `files` in order. Run logs are truncated first. With `single`,
    /// a file that succeeds is moved to the created directory.
    pub fn run(&self, files: &[PathBuf], single: bool) -> Result<ScriptRunSummary, ImportError> {
        fs::create_dir_all(&self.settings.log_dir)?;
        for name in [ERRORS_LOG, SUCCESS_LOG, EXECUTION_LOG] {
            fs::write(self.settings.log_dir.join(name), "")?;
        }

        let mut summary = ScriptRunSummary::default();
        let total = files.len();
        for (i, file) in files.iter().enumerate() {
            let report = self.execute_script(file);
            let name = report.file_name();
            let head = format!("[{}/{}] {}", i + 1, total, name);
            let secs = report.duration.as_secs();
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S");

            let outcome = match &report.status {
                ScriptStatus::Skipped(reason) => {
                    summary.skipped += 1;
                    self.progress.println(&format!(
                        "{} {} skipped: {}",
                        style("-").yellow(),
                        head,
                        reason
                    ));
                    self.append_log(EXECUTION_LOG, &format!("[{}] SKIPPED: {} - {}", ts, name, reason))?;
                    continue;
                }
                ScriptStatus::Success | ScriptStatus::DuplicatesSkipped(_) => {
                    summary.succeeded += 1;
                    let mut stats = format!("({} statements)", report.statements);
                    if let Some(n) = report.inserted() {
                        stats.push_str(&format!(" - {} rows inserted", n));
                    }
                    if let ScriptStatus::DuplicatesSkipped(d) = report.status {
                        stats.push_str(&format!(" - {} duplicates skipped", d));
                    }
                    self.progress
                        .println(&format!("{} {} {} ({}s)", style("✓").green(), head, stats, secs));
                    self.append_log(
                        SUCCESS_LOG,
                        &format!("[{}] SUCCESS: {} - {} - {}s", ts, name, stats, secs),
                    )?;
                    if single {
                        match self.move_to_created(file) {
                            Ok(dest) => {
                                self.progress.println(&format!("  moved to {}", dest.display()));
                                summary.moved.push(dest);
                            }
                            Err(e) => warn!("Could not move {} to created: {}", name, e),
                        }
                    }
                    "SUCCESS".to_string()
                }
                ScriptStatus::Failed(msg) => {
                    summary.failed += 1;
                    self.progress.println(&format!(
                        "{} {} {} ({}s)",
                        style("✗").red(),
                        head,
                        style(msg).red(),
                        secs
                    ));
                    self.append_log(
                        ERRORS_LOG,
                        &format!("[{}] ERROR: {} - {} - {}s", ts, name, msg, secs),
                    )?;
                    msg.clone()
                }
            };
            self.append_log(
                EXECUTION_LOG,
                &format!("[{}] {} - {} - {}s", ts, name, outcome, secs),
            )?;
        }
        Ok(summary)
    }

    /// Execute one script file and write its `.out`/`.err` logs.
    pub fn execute_script(&self, path: &Path) -> ScriptReport {
        let start = Instant::now();
        let mut report = ScriptReport::new(path);
        let status = match self.try_execute(path, &mut report) {
            Ok(status) => status,
            Err(e) => {
                let msg = e.to_string();
                self.write_file_log(&report, "err", &format!("Fatal error: {}\n", msg));
                ScriptStatus::Failed(msg)
            }
        };
        report.status = status;
        report.duration = start.elapsed();
        report
    }

    fn try_execute(
        &self,
        path: &Path,
        report: &mut ScriptReport,
    ) -> Result<ScriptStatus, ImportError> {
        let bytes = fs::read(path)?;
        let content = String::from_utf8_lossy(&bytes);
        if content.trim().is_empty() {
            return Ok(ScriptStatus::Skipped("empty file".to_string()));
        }

        let prefix = &self.settings.table_prefix;
        let schema = self.settings.target_schema.as_deref();
        report.statements = self.parser.count_inserts(&content);
        report.target = self.parser.target_table(&content, prefix, schema);
        if let Some(target) = &report.target {
            report.records_before = self.client.count_rows(target);
        }
        debug!(
            "ExecuteScript: {} statements={} target={:?} before={:?}",
            path.display(),
            report.statements,
            report.target,
            report.records_before
        );

        let content = match schema {
            Some(s) => self.parser.qualify(&content, prefix, s),
            None => content.into_owned(),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix("hdbimport-")
            .suffix(".sql")
            .tempfile()?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;

        let result = match (&report.target, report.records_before) {
            (Some(target), Some(before)) if report.statements > 0 => {
                let label = format!("Execute {}", report.file_name());
                let monitor = ProgressMonitor::new(
                    self.client,
                    target,
                    before,
                    report.statements as u64,
                    self.settings.poll_interval,
                )
                .with_bar(self.progress.new_insert_bar(&label, report.statements as u64));
                let (result, last) =
                    monitor.run(|| self.client.execute_file(tmp.path(), self.settings.timeout));
                report.records_after = last.or_else(|| self.client.count_rows(target));
                result
            }
            _ => self.client.execute_file(tmp.path(), self.settings.timeout),
        };

        self.write_out_log(report, result.as_ref().ok());
        Ok(self.classify(report, result))
    }

    fn classify(
        &self,
        report: &ScriptReport,
        result: Result<ClientOutput, ClientError>,
    ) -> ScriptStatus {
        let out = match result {
            Ok(out) => out,
            Err(e) => {
                let msg = e.to_string();
                self.write_file_log(report, "err", &format!("{}\n", msg));
                return ScriptStatus::Failed(msg);
            }
        };
        if out.success() {
            return ScriptStatus::Success;
        }
        let duplicates = count_unique_violations(&out.stderr);
        if duplicates > 0 {
            let body = format!(
                "Warning: {} rows already existed (unique constraint)\n\
                 The script ran, but some rows were duplicates.\n\
                 \n--- Error details ---\n{}",
                duplicates, out.stderr
            );
            self.write_file_log(report, "err", &body);
            return ScriptStatus::DuplicatesSkipped(duplicates);
        }

        let mut body = out.stderr.clone();
        if !out.stdout.is_empty() {
            body.push_str("\n--- STDOUT ---\n");
            body.push_str(&out.stdout);
        }
        self.write_file_log(report, "err", &body);
        let first = out.stderr.lines().map(str::trim).find(|l| !l.is_empty());
        ScriptStatus::Failed(match first {
            Some(line) => line.to_string(),
            None => format!("client exited with code {}", out.exit_code),
        })
    }

    fn write_out_log(&self, report: &ScriptReport, out: Option<&ClientOutput>) {
        let mut body = out.map(|o| o.stdout.clone()).unwrap_or_default();
        if let (Some(before), Some(after)) = (report.records_before, report.records_after) {
            body.push_str("\n--- Insert statistics ---\n");
            body.push_str(&format!("Rows before: {}\n", before));
            body.push_str(&format!("Rows after: {}\n", after));
            body.push_str(&format!("Rows inserted: {}\n", after as i64 - before as i64));
            body.push_str(&format!("INSERT statements in file: {}\n", report.statements));
        }
        self.write_file_log(report, "out", &body);
    }

    // `<log_dir>/<file name>.<ext>`; failures to log are not fatal.
    fn write_file_log(&self, report: &ScriptReport, ext: &str, body: &str) {
        let path = self
            .settings
            .log_dir
            .join(format!("{}.{}", report.file_name(), ext));
        let res = fs::create_dir_all(&self.settings.log_dir).and_then(|_| fs::write(&path, body));
        if let Err(e) = res {
            warn!("Could not write {}: {}", path.display(), e);
        }
    }

    fn append_log(&self, name: &str, line: &str) -> std::io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.settings.log_dir.join(name))?;
        writeln!(f, "{}", line)
    }

    fn move_to_created(&self, file: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.settings.created_dir)?;
        let name = file.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        let dest = self.settings.created_dir.join(name);
        if fs::rename(file, &dest).is_err() {
            // Different filesystem.
            fs::copy(file, &dest)?;
            fs::remove_file(file)?;
        }
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_unique_violations() {
        let stderr = "* 301: unique constraint violated: Table(DB_T)\n\
                      * 301: Unique constraint violated: Table(DB_T)\n";
        assert_eq!(count_unique_violations(stderr), 2);
        assert_eq!(count_unique_violations("syntax error"), 0);
    }

    #[test]
    fn lists_sql_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.sql", "a.sql", "notes.txt"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        fs::create_dir(dir.path().join("c.sql")).unwrap();
        let files = list_scripts(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.sql", "b.sql"]);
    }

    #[test]
    fn inserted_needs_both_counts() {
        let mut r = ScriptReport::new(Path::new("x.sql"));
        assert_eq!(r.inserted(), None);
        r.records_before = Some(10);
        r.records_after = Some(13);
        assert_eq!(r.inserted(), Some(3));
    }
}
