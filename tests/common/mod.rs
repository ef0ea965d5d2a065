// In-memory stand-in for the command-line client. It answers the handful of
// statement shapes the importer sends, with the same output layout as the
// real client: a header line, quoted CSV rows and a "rows selected" footer.

#![allow(dead_code)]

use hdbimport::client::{ClientOutput, SqlClient};
use hdbimport::error::ClientError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct FakeDb {
    rows: Mutex<Vec<Vec<String>>>,
    unique: Vec<usize>,
    fail_marker: Option<String>,
    count_broken: AtomicBool,
    pub insert_attempts: AtomicUsize,
    pub page_fetches: AtomicUsize,
}

impl FakeDb {
    /// `unique` lists the column positions the table enforces as unique.
    pub fn new(unique: Vec<usize>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            unique,
            fail_marker: None,
            count_broken: AtomicBool::new(false),
            insert_attempts: AtomicUsize::new(0),
            page_fetches: AtomicUsize::new(0),
        }
    }

    /// Values equal to `marker` are rejected like a type mismatch.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn seed(&self, rows: &[&[&str]]) {
        let mut guard = self.rows.lock().unwrap();
        for r in rows {
            guard.push(r.iter().map(|v| v.to_string()).collect());
        }
    }

    pub fn break_count(&self) {
        self.count_broken.store(true, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().unwrap().clone()
    }

    fn ok(stdout: String) -> ClientOutput {
        ClientOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        }
    }

    fn err(stderr: &str) -> ClientOutput {
        ClientOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn count(&self) -> ClientOutput {
        if self.count_broken.load(Ordering::SeqCst) {
            return Self::err("* -10709: Connection failed");
        }
        let n = self.rows.lock().unwrap().len();
        Self::ok(format!("COUNT(*)\n{}\n1 row selected (overall time 1 ms)\n", n))
    }

    fn page(&self, stmt: &str) -> ClientOutput {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        let limit = number_after(stmt, "LIMIT").unwrap_or(0);
        let offset = number_after(stmt, "OFFSET").unwrap_or(0);
        let rows = self.rows.lock().unwrap();
        let page: Vec<&Vec<String>> = rows.iter().skip(offset).take(limit).collect();

        let mut out = String::from("COLUMNS\n");
        for r in &page {
            let fields: Vec<String> = r
                .iter()
                .map(|v| format!("\"{}\"", v.replace('"', "\"\"")))
                .collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out.push_str(&format!("{} rows selected (overall time 2 ms)\n", page.len()));
        Self::ok(out)
    }

    fn insert(&self, stmt: &str) -> ClientOutput {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let values = match parse_values(stmt) {
            Some(v) => v,
            None => return Self::err("* 257: sql syntax error"),
        };
        if let Some(marker) = &self.fail_marker {
            if values.iter().any(|v| v == marker) {
                return Self::err(&format!(
                    "* 339: invalid number: not a valid number string '{}'",
                    marker
                ));
            }
        }
        let mut rows = self.rows.lock().unwrap();
        let key = |r: &Vec<String>| -> Vec<String> {
            self.unique.iter().map(|&i| r.get(i).cloned().unwrap_or_default()).collect()
        };
        let new_key = key(&values);
        if rows.iter().any(|r| key(r) == new_key) {
            return Self::err("* 301: unique constraint violated: Table(DB_T)");
        }
        rows.push(values);
        Self::ok(String::new())
    }
}

impl SqlClient for FakeDb {
    fn execute(
        &self,
        statement: &str,
        _timeout: Option<Duration>,
    ) -> Result<ClientOutput, ClientError> {
        let s = statement.trim();
        let upper = s.to_uppercase();
        if upper.starts_with("SELECT COUNT(*)") {
            Ok(self.count())
        } else if upper.starts_with("SELECT 1 FROM DUMMY") {
            Ok(Self::ok("1\n1\n".to_string()))
        } else if upper.starts_with("SELECT") {
            Ok(self.page(s))
        } else if upper.starts_with("INSERT INTO") {
            Ok(self.insert(s))
        } else {
            Ok(Self::err("* 257: sql syntax error"))
        }
    }

    fn execute_file(
        &self,
        path: &Path,
        _timeout: Option<Duration>,
    ) -> Result<ClientOutput, ClientError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ClientError::MissingFile(path.to_path_buf()))?;
        let mut stderr = String::new();
        for line in content.lines() {
            if line.trim_start().to_uppercase().starts_with("INSERT INTO") {
                let out = self.insert(line);
                if !out.success() {
                    stderr.push_str(&out.stderr);
                    stderr.push('\n');
                }
            }
        }
        Ok(ClientOutput {
            exit_code: if stderr.is_empty() { 0 } else { 1 },
            stdout: String::new(),
            stderr,
        })
    }
}

fn number_after(stmt: &str, word: &str) -> Option<usize> {
    let upper = stmt.to_uppercase();
    let pos = upper.find(&format!(" {} ", word))?;
    stmt[pos + word.len() + 2..]
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

// Values of `... VALUES ('a', 'b''c');` as plain strings.
fn parse_values(stmt: &str) -> Option<Vec<String>> {
    let start = stmt.to_uppercase().find("VALUES")?;
    let mut chars = stmt[start + 6..].chars().peekable();
    let mut values = Vec::new();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut v = String::new();
        loop {
            match chars.next()? {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    v.push('\'');
                }
                '\'' => break,
                other => v.push(other),
            }
        }
        values.push(v);
    }
    Some(values)
}

pub fn ddl(columns: &[&str], pk: Option<&[&str]>) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|c| format!("\"{}\" NVARCHAR(100)", c))
        .collect();
    if let Some(pk) = pk {
        let cols: Vec<String> = pk.iter().map(|c| format!("\"{}\"", c)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }
    format!(
        "CREATE COLUMN TABLE \"SRC\".\"T\" ({}) UNLOAD PRIORITY 5 AUTO MERGE",
        parts.join(", ")
    )
}
