// Reconciliation: key the CSV rows, then page through the live table on a
// small worker pool and drop every pending row whose key is already present.
// Whatever survives is the insert set.

use crate::client::SqlClient;
use crate::config::Tunables;
use crate::error::ImportError;
use crate::parser::{TableSpec, TargetTable};
use ahash::AHashMap;
use indicatif::ProgressBar;
use rayon::prelude::*;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Trim, then strip one layer of matching surrounding quotes.
/// Applied identically to CSV values and live values.
pub fn normalize_value(val: &str) -> String {
    let v = val.trim();
    if v.len() >= 2 {
        let bytes = v.as_bytes();
        let (first, last) = (bytes[0], bytes[v.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return v[1..v.len() - 1].to_string();
        }
    }
    v.to_string()
}

/// Ordered tuple of normalized values identifying a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(Vec<String>);

impl RowKey {
    pub fn values(&self) -> &[String] {
        &self.0
    }
}

/// How rows of one table are identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShape {
    /// Positions of the primary-key columns.
    PrimaryKey(Vec<usize>),
    /// Every column, for tables without a resolvable key.
    FullRow(usize),
}

impl KeyShape {
    pub fn for_table(spec: &TableSpec) -> Self {
        match spec.primary_key_positions() {
            Some(idx) => KeyShape::PrimaryKey(idx),
            None => KeyShape::FullRow(spec.columns.len()),
        }
    }

    pub fn is_primary_key(&self) -> bool {
        matches!(self, KeyShape::PrimaryKey(_))
    }

    /// Project a row onto the key. Missing positions read as empty.
    pub fn key_for(&self, values: &[String]) -> RowKey {
        let at = |i: usize| values.get(i).map(|v| normalize_value(v)).unwrap_or_default();
        match self {
            KeyShape::PrimaryKey(idx) => RowKey(idx.iter().map(|&i| at(i)).collect()),
            KeyShape::FullRow(width) => RowKey((0..*width).map(at).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRow {
    /// 1-based CSV record number.
    pub ordinal: usize,
    pub values: Vec<String>,
}

/// CSV rows still to be inserted, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct PendingRowSet {
    rows: AHashMap<RowKey, PendingRow>,
}

impl PendingRowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    /// Insert or replace (last row wins).
    pub fn insert(&mut self, key: RowKey, row: PendingRow) {
        self.rows.insert(key, row);
    }

    pub fn remove(&mut self, key: &RowKey) -> Option<PendingRow> {
        self.rows.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> {
        self.rows.keys()
    }

    /// Rows in CSV order.
    pub fn rows_in_order(&self) -> Vec<&PendingRow> {
        let mut rows: Vec<&PendingRow> = self.rows.values().collect();
        rows.sort_by_key(|r| r.ordinal);
        rows
    }
}

/// Parse CSV text into the pending set. There is no header row; every record
/// is data, padded or cut to the table's column count.
pub fn load_pending(
    spec: &TableSpec,
    shape: &KeyShape,
    csv_text: &str,
) -> Result<PendingRowSet, csv::Error> {
    let width = spec.columns.len();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let bytes = csv_text.as_bytes();
    let mut pending = PendingRowSet::default();
    let mut record = csv::StringRecord::new();
    let mut records = 0usize;
    let mut ordinal = 0usize;
    loop {
        let start = reader.position().byte() as usize;
        if !reader.read_record(&mut record)? {
            break;
        }
        records += 1;
        // Blank lines are skipped by the reader but still count as rows.
        ordinal += 1 + blank_lines_at(bytes, start);
        let mut values: Vec<String> = record.iter().take(width).map(str::to_string).collect();
        values.resize(width, String::new());
        let key = shape.key_for(&values);
        pending.insert(key, PendingRow { ordinal, values });
    }
    debug!(
        "LoadPending: {} records, {} distinct keys for {}",
        records,
        pending.len(),
        spec.name
    );
    Ok(pending)
}

// Empty lines starting at byte `pos`. The reader may stop before the previous
// record's terminator, which is not a blank line.
fn blank_lines_at(text: &[u8], pos: usize) -> usize {
    let mut i = pos.min(text.len());
    if i > 0 {
        match (text[i - 1], text.get(i)) {
            (b'\r', Some(b'\n')) => i += 1,
            (b'\n', _) | (b'\r', _) => {}
            (_, Some(b'\r')) if text.get(i + 1) == Some(&b'\n') => i += 2,
            (_, Some(b'\r')) | (_, Some(b'\n')) => i += 1,
            _ => {}
        }
    }
    let mut blanks = 0;
    loop {
        match (text.get(i), text.get(i + 1)) {
            (Some(b'\r'), Some(b'\n')) => i += 2,
            (Some(b'\r'), _) | (Some(b'\n'), _) => i += 1,
            _ => return blanks,
        }
        blanks += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live row count before reconciliation; `None` when it was unknown.
    pub live_count: Option<u64>,
    pub pages: u64,
    /// Pending rows dropped because their key was already present.
    pub duplicates: usize,
}

// The pending map and its duplicate counter live under one lock so removal
// and counting are a single step.
struct Shared {
    pending: PendingRowSet,
    duplicates: usize,
}

fn read_or_recover(lock: &RwLock<Shared>) -> RwLockReadGuard<'_, Shared> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_or_recover(lock: &RwLock<Shared>) -> RwLockWriteGuard<'_, Shared> {
    match lock.write() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Remove every pending row already present in `target`.
///
/// An unknown or zero live count skips the comparison entirely. Pages are
/// fetched on a dedicated pool of `compare_workers` threads; a failed page
/// counts as empty, so the result only ever errs toward attempting inserts.
pub fn reconcile<C: SqlClient + ?Sized>(
    client: &C,
    target: &TargetTable,
    spec: &TableSpec,
    shape: &KeyShape,
    pending: PendingRowSet,
    tunables: &Tunables,
    bar: Option<&ProgressBar>,
) -> Result<(PendingRowSet, ReconcileReport), ImportError> {
    let mut report = ReconcileReport::default();
    if pending.is_empty() {
        return Ok((pending, report));
    }

    let count = match client.count_rows(target) {
        Some(0) => {
            debug!("Reconcile: {} is empty, all {} rows are new", target, pending.len());
            report.live_count = Some(0);
            return Ok((pending, report));
        }
        Some(n) => n,
        None => {
            debug!(
                "Reconcile: row count of {} unknown, treating all {} rows as new",
                target,
                pending.len()
            );
            return Ok((pending, report));
        }
    };
    report.live_count = Some(count);

    let page_size = tunables.page_size.max(1) as u64;
    let pages = count.div_ceil(page_size);
    report.pages = pages;
    debug!(
        "Reconcile: {} has {} rows, comparing {} pages of {} on {} workers",
        target, count, pages, page_size, tunables.compare_workers
    );
    if let Some(b) = bar {
        b.set_length(pages);
    }

    let columns = spec.column_names();
    let shared = RwLock::new(Shared {
        pending,
        duplicates: 0,
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(tunables.compare_workers.max(1))
        .thread_name(|i| format!("compare-{}", i))
        .build()?;

    pool.install(|| {
        (0..pages).into_par_iter().for_each(|page| {
            let offset = page * page_size;
            let live = client.fetch_rows(target, &columns, offset, tunables.page_size);
            let removed = compare_page(&shared, shape, &live);
            if removed > 0 {
                debug!(
                    "Reconcile: page {} of {} matched {} pending rows",
                    page + 1,
                    target,
                    removed
                );
            }
            if let Some(b) = bar {
                b.inc(1);
            }
        });
    });

    let shared = match shared.into_inner() {
        Ok(s) => s,
        Err(poisoned) => poisoned.into_inner(),
    };
    report.duplicates = shared.duplicates;
    debug!(
        "Reconcile: {} duplicates found, {} rows remain for {}",
        report.duplicates,
        shared.pending.len(),
        target
    );
    Ok((shared.pending, report))
}

// Probe under the read lock, then remove under the write lock with a re-check.
// Returns how many rows this page removed.
fn compare_page(shared: &RwLock<Shared>, shape: &KeyShape, live_rows: &[Vec<String>]) -> usize {
    if live_rows.is_empty() {
        return 0;
    }
    let keys: Vec<RowKey> = live_rows.iter().map(|r| shape.key_for(r)).collect();

    let candidates: Vec<RowKey> = {
        let guard = read_or_recover(shared);
        keys.into_iter()
            .filter(|k| guard.pending.contains(k))
            .collect()
    };
    if candidates.is_empty() {
        return 0;
    }

    let mut guard = write_or_recover(shared);
    let mut removed = 0;
    for key in &candidates {
        if guard.pending.remove(key).is_some() {
            removed += 1;
        }
    }
    guard.duplicates += removed;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ColumnDef;

    fn spec(cols: &[&str], pk: Option<&[&str]>) -> TableSpec {
        TableSpec {
            name: "T".to_string(),
            columns: cols
                .iter()
                .map(|c| ColumnDef {
                    name: c.to_string(),
                    source_type: "NVARCHAR(10)".to_string(),
                })
                .collect(),
            primary_key: pk.map(|p| p.iter().map(|c| c.to_string()).collect()),
        }
    }

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn normalization_equates_quoting_and_whitespace() {
        assert_eq!(normalize_value("  X "), "X");
        assert_eq!(normalize_value("\"X\""), "X");
        assert_eq!(normalize_value("'X'"), "X");
        assert_eq!(normalize_value(" ' X' "), " X");
        assert_eq!(normalize_value("'X\""), "'X\"");
        assert_eq!(normalize_value("\"\"\"X\"\"\""), "\"\"X\"\"");
        assert_eq!(normalize_value("'"), "'");
        assert_eq!(normalize_value("   "), "");
    }

    #[test]
    fn key_shape_uses_primary_key_when_resolvable() {
        let s = spec(&["ID", "NAME"], Some(&["ID"]));
        let shape = KeyShape::for_table(&s);
        assert_eq!(shape, KeyShape::PrimaryKey(vec![0]));
        assert_eq!(
            shape.key_for(&row(&[" 1 ", "a"])),
            shape.key_for(&row(&["'1'", "b"]))
        );
    }

    #[test]
    fn unknown_key_column_falls_back_to_full_row() {
        let s = spec(&["ID", "NAME"], Some(&["ID", "GONE"]));
        let shape = KeyShape::for_table(&s);
        assert_eq!(shape, KeyShape::FullRow(2));
        assert_ne!(
            shape.key_for(&row(&["1", "a"])),
            shape.key_for(&row(&["1", "b"]))
        );
        assert_eq!(
            shape.key_for(&row(&["1", "a"])),
            shape.key_for(&row(&["\"1\"", " a"]))
        );
    }

    #[test]
    fn load_pads_truncates_and_keeps_last_duplicate() {
        let s = spec(&["ID", "NAME", "NOTE"], Some(&["ID"]));
        let shape = KeyShape::for_table(&s);
        let csv = "1,a\n2,b,c,extra\n1,z,last\n";
        let pending = load_pending(&s, &shape, csv).unwrap();
        assert_eq!(pending.len(), 2);

        let rows = pending.rows_in_order();
        assert_eq!(rows[0].ordinal, 2);
        assert_eq!(rows[0].values, row(&["2", "b", "c"]));
        assert_eq!(rows[1].ordinal, 3);
        assert_eq!(rows[1].values, row(&["1", "z", "last"]));
    }

    #[test]
    fn load_handles_quoted_fields() {
        let s = spec(&["ID", "TEXT"], None);
        let shape = KeyShape::for_table(&s);
        let pending = load_pending(&s, &shape, "\"1\",\"hello, world\"\n").unwrap();
        let rows = pending.rows_in_order();
        assert_eq!(rows[0].values, row(&["1", "hello, world"]));
    }

    fn ordinals(csv: &str) -> Vec<usize> {
        let s = spec(&["ID", "NAME"], Some(&["ID"]));
        let shape = KeyShape::for_table(&s);
        let pending = load_pending(&s, &shape, csv).unwrap();
        pending.rows_in_order().iter().map(|r| r.ordinal).collect()
    }

    #[test]
    fn blank_lines_count_towards_row_numbers() {
        assert_eq!(ordinals("1,a\n\n2,b\n"), vec![1, 3]);
        assert_eq!(ordinals("\n1,a\n2,b\n\n\n3,c"), vec![2, 3, 6]);
        assert_eq!(ordinals("1,a\r\n\r\n2,b\r\n"), vec![1, 3]);
        // A newline inside a quoted value is not a blank line.
        assert_eq!(ordinals("1,\"x\n\ny\"\n2,b\n"), vec![1, 2]);
    }

    #[test]
    fn blank_line_scan_skips_unfinished_terminator() {
        assert_eq!(blank_lines_at(b"1,a\n\n2,b\n", 4), 1);
        assert_eq!(blank_lines_at(b"1,a\n\n2,b\n", 3), 1);
        assert_eq!(blank_lines_at(b"1,a\r\n\r\n2", 4), 1);
        assert_eq!(blank_lines_at(b"1,a\n2", 4), 0);
        assert_eq!(blank_lines_at(b"1,a", 3), 0);
    }

    #[test]
    fn compare_page_removes_and_counts_once() {
        let s = spec(&["ID"], Some(&["ID"]));
        let shape = KeyShape::for_table(&s);
        let pending = load_pending(&s, &shape, "1\n2\n3\n").unwrap();
        let shared = RwLock::new(Shared {
            pending,
            duplicates: 0,
        });

        assert_eq!(compare_page(&shared, &shape, &[row(&["2"]), row(&["9"])]), 1);
        // Overlapping page: the key is already gone.
        assert_eq!(compare_page(&shared, &shape, &[row(&["'2'"])]), 0);
        assert_eq!(compare_page(&shared, &shape, &[]), 0);

        let shared = shared.into_inner().unwrap();
        assert_eq!(shared.duplicates, 1);
        assert_eq!(shared.pending.len(), 2);
    }
}
