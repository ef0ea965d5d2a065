// INSERT statement helpers: rendering single-row INSERTs for the target and
// scanning SQL scripts (statement counting, target-table detection, schema
// qualification).
// Parsing stays deliberately simple (no full SQL grammar).

use regex::Regex;
use std::fmt;
use tracing::debug;

/// A target table, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub schema: Option<String>,
    pub table: String,
}

impl TargetTable {
    pub fn qualified(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    pub fn bare(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }
}

// Qualified names are quoted; bare names are emitted as-is so the client's
// current schema (or a later qualification pass) applies.
impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => f.write_str(&self.table),
        }
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a CSV value as a SQL string literal.
pub fn escape_sql_value(val: &str) -> String {
    format!("'{}'", val.replace('\'', "''"))
}

/// Render `INSERT INTO <target> ("c1", ...) VALUES ('v1', ...);`.
pub fn render_insert(target: &TargetTable, columns: &[String], values: &[String]) -> String {
    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let vals: Vec<String> = values.iter().map(|v| escape_sql_value(v)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({});",
        target,
        cols.join(", "),
        vals.join(", ")
    )
}

pub struct ScriptParser {
    quoted_re: Regex,
    dotted_re: Regex,
    bare_re: Regex,
}

impl Default for ScriptParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptParser {
    pub fn new() -> Self {
        Self {
            quoted_re: Regex::new(r#"(?i)INSERT\s+INTO\s+"([^"]+)"\s*\.\s*"([^"]+)""#)
                .expect("valid quoted table regex"),
            dotted_re: Regex::new(r"(?i)INSERT\s+INTO\s+(\w+)\s*\.\s*(\w+)")
                .expect("valid dotted table regex"),
            bare_re: Regex::new(r#"(?i)INSERT\s+INTO\s+"?(\w+)"?"#).expect("valid bare table regex"),
        }
    }

    /// Count complete INSERT statements in a script.
    pub fn count_inserts(&self, content: &str) -> usize {
        let mut acc = InsertAccumulator::new();
        for line in content.split_inclusive('\n') {
            acc.process_line(line);
        }
        acc.finalize();
        debug!("CountInserts: {} statements", acc.statements_processed);
        acc.statements_processed
    }

    /// Target table of the first INSERT. Bare names carrying `prefix` are
    /// placed in `default_schema`; other bare names stay unqualified.
    pub fn target_table(
        &self,
        content: &str,
        prefix: &str,
        default_schema: Option<&str>,
    ) -> Option<TargetTable> {
        if let Some(cap) = self.quoted_re.captures(content) {
            return Some(TargetTable::qualified(&cap[1], &cap[2]));
        }
        if let Some(cap) = self.dotted_re.captures(content) {
            return Some(TargetTable::qualified(&cap[1], &cap[2]));
        }
        let cap = self.bare_re.captures(content)?;
        let table = cap[1].to_string();
        let has_prefix = !prefix.is_empty()
            && table.to_uppercase().starts_with(&prefix.to_uppercase());
        match default_schema {
            Some(schema) if has_prefix => Some(TargetTable::qualified(schema, table)),
            _ => Some(TargetTable::bare(table)),
        }
    }

    /// Rewrite `INSERT INTO <prefix>X` as `INSERT INTO "schema"."<prefix>X"`.
    pub fn qualify(&self, content: &str, prefix: &str, schema: &str) -> String {
        let pattern = format!(r"(?i)(INSERT\s+INTO)\s+({}\w*)", regex::escape(prefix));
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                debug!("Qualify: bad prefix pattern {}: {}", pattern, e);
                return content.to_string();
            }
        };
        re.replace_all(content, |cap: &regex::Captures| {
            format!("{} {}", &cap[1], TargetTable::qualified(schema, &cap[2]))
        })
        .into_owned()
    }
}

// Tracks an INSERT statement across multiple lines.
struct InsertAccumulator {
    in_single_quote: bool,
    in_double_quote: bool,
    paren_depth: i32,
    in_insert: bool,
    statements_processed: usize,
}

impl InsertAccumulator {
    fn new() -> Self {
        Self {
            in_single_quote: false,
            in_double_quote: false,
            paren_depth: 0,
            in_insert: false,
            statements_processed: 0,
        }
    }

    fn process_line(&mut self, line: &str) {
        if !self.in_insert {
            let trimmed = line.trim_start();
            if trimmed.starts_with("--") || !trimmed.to_uppercase().contains("INSERT INTO") {
                return;
            }
            self.in_insert = true;
            self.reset_state();
        }

        self.process_line_content(line);
        if line.trim_end().ends_with(';')
            && self.paren_depth == 0
            && !self.in_single_quote
            && !self.in_double_quote
        {
            self.in_insert = false;
            self.statements_processed += 1;
        }
    }

    // Scan characters to keep track of quotes and parenthesis depth.
    // SQL escapes quotes by doubling them, which toggles twice and nets out.
    fn process_line_content(&mut self, line: &str) {
        for c in line.chars() {
            if c == '\'' && !self.in_double_quote {
                self.in_single_quote = !self.in_single_quote;
            } else if c == '"' && !self.in_single_quote {
                self.in_double_quote = !self.in_double_quote;
            } else if !self.in_single_quote && !self.in_double_quote {
                if c == '(' {
                    self.paren_depth += 1;
                } else if c == ')' {
                    self.paren_depth -= 1;
                }
            }
        }
    }

    // A statement cut off at EOF still counts (best effort).
    fn finalize(&mut self) {
        if self.in_insert {
            self.in_insert = false;
            self.statements_processed += 1;
        }
    }

    fn reset_state(&mut self) {
        self.in_single_quote = false;
        self.in_double_quote = false;
        self.paren_depth = 0;
    }
}
