//! External SQL client wrapper.
//!
//! Every call spawns one short-lived client process, so a single [`HdbClient`]
//! is shared by all worker threads without locking. The engine is written
//! against the [`SqlClient`] trait; the typed helpers (`count_rows`,
//! `fetch_rows`, `ping`) are provided on top of `execute`.

use crate::config::{Config, ConnectionParams};
use crate::error::{ClientError, ConfigError, ImportError};
use crate::parser::{quote_ident, TargetTable};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Binary name searched on `PATH`.
pub const CLIENT_BINARY: &str = "hdbsql";

pub const COUNT_TIMEOUT: Duration = Duration::from_secs(60);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

const PING_QUERY: &str = "SELECT 1 FROM DUMMY;";

/// Raw result of one client invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ClientOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait SqlClient: Sync {
    /// Run one statement through the client's standard-input mode.
    fn execute(&self, statement: &str, timeout: Option<Duration>)
        -> Result<ClientOutput, ClientError>;

    /// Run a file of statements through the client's batch mode.
    fn execute_file(&self, path: &Path, timeout: Option<Duration>)
        -> Result<ClientOutput, ClientError>;

    /// Live row count, or `None` when it cannot be determined.
    /// `None` means "unknown", never zero.
    fn count_rows(&self, target: &TargetTable) -> Option<u64> {
        let query = format!("SELECT COUNT(*) FROM {};", target);
        match self.execute(&query, Some(COUNT_TIMEOUT)) {
            Ok(out) if out.success() => {
                let count = parse_count_output(&out.stdout);
                if count.is_none() {
                    debug!("CountRows: unparsable output for {}: {:?}", target, out.stdout);
                }
                count
            }
            Ok(out) => {
                debug!(
                    "CountRows: {} failed with exit code {}: {}",
                    target,
                    out.exit_code,
                    out.stderr.trim()
                );
                None
            }
            Err(e) => {
                debug!("CountRows: {} failed: {}", target, e);
                None
            }
        }
    }

    /// One page of live rows projected onto `columns`.
    ///
    /// Every failure degrades to an empty page. A missing table is expected
    /// and logged quietly; anything else is logged as a warning.
    fn fetch_rows(
        &self,
        target: &TargetTable,
        columns: &[String],
        offset: u64,
        limit: usize,
    ) -> Vec<Vec<String>> {
        if columns.is_empty() {
            return Vec::new();
        }
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let query = format!(
            "SELECT {} FROM {} LIMIT {} OFFSET {};",
            cols.join(", "),
            target,
            limit,
            offset
        );
        match self.execute(&query, Some(FETCH_TIMEOUT)) {
            Ok(out) if out.success() => parse_rows_output(&out.stdout, columns.len()),
            Ok(out) => {
                if is_missing_table_error(&out.stderr) {
                    debug!("FetchRows: {} does not exist", target);
                } else {
                    warn!(
                        "FetchRows: page at offset {} of {} failed (exit {}): {}",
                        offset,
                        target,
                        out.exit_code,
                        out.stderr.trim()
                    );
                }
                Vec::new()
            }
            Err(e) => {
                warn!("FetchRows: page at offset {} of {} failed: {}", offset, target, e);
                Vec::new()
            }
        }
    }

    /// Liveness check run before any table is touched.
    fn ping(&self) -> Result<(), ImportError> {
        let out = self.execute(PING_QUERY, Some(PING_TIMEOUT))?;
        if out.success() {
            Ok(())
        } else {
            let msg = if out.stderr.trim().is_empty() {
                format!("client exited with code {}", out.exit_code)
            } else {
                out.stderr.trim().to_string()
            };
            Err(ImportError::Connectivity(msg))
        }
    }
}

/// Error text of a missing table. The client has no structured error channel,
/// so this is a fixed vocabulary of phrases.
pub fn is_missing_table_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("table")
        && (lower.contains("not found")
            || lower.contains("does not exist")
            || lower.contains("invalid table"))
}

/// The "N row(s) selected" summary line the client prints after results.
pub fn is_footer_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("rows selected") || lower.contains("row selected")
}

/// First data line of a `SELECT COUNT(*)` result.
pub fn parse_count_output(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(|l| l.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|l| !l.is_empty())
        .filter(|l| !l.to_uppercase().starts_with("COUNT"))
        .find(|l| !is_footer_line(l))
        .and_then(|l| l.parse::<u64>().ok())
}

/// Parse delimited SELECT output: header skipped, footer skipped, rows padded
/// with empty strings (and cut) to `width` columns. Values are returned raw;
/// key normalization happens in the reconciliation engine.
pub fn parse_rows_output(stdout: &str, width: usize) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(stdout.as_bytes());

    let mut rows = Vec::new();
    let mut header_skipped = false;
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("ParseRows: skipping unreadable line: {}", e);
                continue;
            }
        };
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        if !header_skipped {
            header_skipped = true;
            continue;
        }
        let joined = record.iter().collect::<Vec<_>>().join(" ");
        if is_footer_line(&joined) {
            continue;
        }
        let mut values: Vec<String> = record.iter().take(width).map(str::to_string).collect();
        values.resize(width, String::new());
        rows.push(values);
    }
    rows
}

/// Locate the client binary: `PATH` first, then the configured location
/// (a file, or a directory containing the binary).
pub fn find_client_binary(configured: Option<&Path>) -> Option<PathBuf> {
    if let Ok(path) = which::which(CLIENT_BINARY) {
        return Some(path);
    }
    let configured = configured?;
    if configured.is_file() {
        return Some(configured.to_path_buf());
    }
    if configured.is_dir() {
        let candidate = configured.join(CLIENT_BINARY);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Handle bound to one endpoint and one client binary.
#[derive(Debug, Clone)]
pub struct HdbClient {
    binary: PathBuf,
    params: ConnectionParams,
}

impl HdbClient {
    pub fn new(binary: PathBuf, params: ConnectionParams) -> Self {
        Self { binary, params }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let params = config.require_connection()?.clone();
        let binary =
            find_client_binary(config.client_path.as_deref()).ok_or(ConfigError::ClientNotFound)?;
        debug!("HdbClient: using {} for {}", binary.display(), params.endpoint());
        Ok(Self::new(binary, params))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-n")
            .arg(self.params.endpoint())
            .arg("-u")
            .arg(&self.params.user)
            .arg("-p")
            .arg(&self.params.password)
            .arg("-attemptencrypt")
            .arg("-quiet");
        if let Some(db) = &self.params.database {
            cmd.arg("-d").arg(db);
        }
        cmd
    }

    fn run(
        &self,
        mut cmd: Command,
        input: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ClientOutput, ClientError> {
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ClientError::Spawn {
            path: self.binary.clone(),
            source,
        })?;

        // Pipes are drained on their own threads so a chatty client can never
        // block on a full pipe while we wait for it.
        thread::scope(|s| {
            if let (Some(mut stdin), Some(text)) = (child.stdin.take(), input) {
                s.spawn(move || {
                    if let Err(e) = stdin.write_all(text.as_bytes()) {
                        trace!("HdbClient: stdin closed early: {}", e);
                    }
                });
            }
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let out_handle = s.spawn(move || read_pipe(stdout));
            let err_handle = s.spawn(move || read_pipe(stderr));

            let status = wait_with_timeout(&mut child, timeout);
            let stdout = out_handle.join().unwrap_or_default();
            let stderr = err_handle.join().unwrap_or_default();

            let status = status?;
            Ok(ClientOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        })
    }
}

impl SqlClient for HdbClient {
    fn execute(
        &self,
        statement: &str,
        timeout: Option<Duration>,
    ) -> Result<ClientOutput, ClientError> {
        trace!("HdbClient: execute {}", statement);
        self.run(self.base_command(), Some(statement), timeout)
    }

    fn execute_file(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<ClientOutput, ClientError> {
        if !path.exists() {
            return Err(ClientError::MissingFile(path.to_path_buf()));
        }
        debug!("HdbClient: execute file {}", path.display());
        let mut cmd = self.base_command();
        cmd.arg("-I").arg(path);
        self.run(cmd, None, timeout)
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        if let Err(e) = p.read_to_end(&mut buf) {
            trace!("HdbClient: pipe read error: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// Poll the child until it exits or the deadline passes; on timeout the child
// is killed and reaped before reporting.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<ExitStatus, ClientError> {
    let timeout = match timeout {
        Some(t) => t,
        None => return Ok(child.wait()?),
    };
    let deadline = Instant::now() + timeout;
    let mut pause = Duration::from_millis(2);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                debug!("HdbClient: kill after timeout failed: {}", e);
            }
            let _ = child.wait();
            return Err(ClientError::Timeout(timeout));
        }
        thread::sleep(pause);
        pause = std::cmp::min(pause * 2, Duration::from_millis(50));
    }
}
