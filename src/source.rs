//! Export discovery.
//!
//! An export is laid out as `index/<SCHEMA>/<CODE>/<TABLE>/{table.xml,
//! create.sql, data.csv}`, either inside a `.tar.gz` archive or already
//! unpacked into an extraction directory. The extracted tree is preferred
//! whenever it exists.

use crate::error::SourceError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};
use walkdir::WalkDir;

const DATA_FILE: &str = "data.csv";
const DDL_FILE: &str = "create.sql";
const XML_FILE: &str = "table.xml";

/// One table of the export.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableEntry {
    pub schema: String,
    pub code: String,
    pub table: String,
}

impl TableEntry {
    /// Parse `index/<schema>/<code>/<table>/data.csv`.
    pub fn from_data_path(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.trim_start_matches("./").split('/').collect();
        match parts.as_slice() {
            ["index", schema, code, table, DATA_FILE] => Some(Self {
                schema: schema.to_string(),
                code: code.to_string(),
                table: table.to_string(),
            }),
            _ => None,
        }
    }

    fn dir(&self) -> String {
        format!("index/{}/{}/{}", self.schema, self.code, self.table)
    }

    pub fn data_path(&self) -> String {
        format!("{}/{}", self.dir(), DATA_FILE)
    }

    pub fn ddl_path(&self) -> String {
        format!("{}/{}", self.dir(), DDL_FILE)
    }

    pub fn xml_path(&self) -> String {
        format!("{}/{}", self.dir(), XML_FILE)
    }
}

/// Archive and/or extracted directory holding an export.
#[derive(Debug, Clone)]
pub struct ExportSource {
    archive: PathBuf,
    extract_dir: PathBuf,
}

impl ExportSource {
    /// Fails when neither the archive nor the extracted tree exists.
    pub fn open(archive: &Path, extract_dir: &Path) -> Result<Self, SourceError> {
        let source = Self {
            archive: archive.to_path_buf(),
            extract_dir: extract_dir.to_path_buf(),
        };
        if !source.has_archive() && !source.extract_dir.join("index").is_dir() {
            return Err(SourceError::NotFound {
                archive: source.archive,
                extracted: source.extract_dir,
            });
        }
        Ok(source)
    }

    pub fn has_archive(&self) -> bool {
        self.archive.is_file()
    }

    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }

    /// True when `index/<schema>` is unpacked and holds at least one table.
    pub fn is_extracted(&self, schema: &str) -> bool {
        let dir = self.extract_dir.join("index").join(schema);
        dir.is_dir()
            && WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().is_file() && e.file_name() == DATA_FILE)
    }

    /// First directory under `index/`: archive members first, then the
    /// extracted tree.
    pub fn detect_schema(&self) -> Option<String> {
        if self.has_archive() {
            match self.detect_schema_in_archive() {
                Ok(Some(schema)) => return Some(schema),
                Ok(None) => {}
                Err(e) => debug!("DetectSchema: {}", e),
            }
        }
        let index = self.extract_dir.join("index");
        let mut names: Vec<String> = fs::read_dir(&index)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.into_iter().next()
    }

    fn detect_schema_in_archive(&self) -> Result<Option<String>, SourceError> {
        let mut found = None;
        self.for_each_member(|path, _| {
            let mut parts = path.trim_start_matches("./").split('/');
            if let (Some("index"), Some(schema)) = (parts.next(), parts.next()) {
                if !schema.is_empty() {
                    found = Some(schema.to_string());
                    return Ok(false);
                }
            }
            Ok(true)
        })?;
        Ok(found)
    }

    /// Every table of `schema`, sorted by table name.
    pub fn tables(&self, schema: &str) -> Result<Vec<TableEntry>, SourceError> {
        let mut entries = if self.is_extracted(schema) {
            self.tables_in_dir(schema)?
        } else if self.has_archive() {
            self.tables_in_archive(schema)?
        } else {
            Vec::new()
        };
        entries.sort_by(|a, b| a.table.cmp(&b.table).then_with(|| a.code.cmp(&b.code)));
        entries.dedup();
        debug!("Tables: {} tables for schema {}", entries.len(), schema);
        Ok(entries)
    }

    fn tables_in_dir(&self, schema: &str) -> Result<Vec<TableEntry>, SourceError> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(self.extract_dir.join("index").join(schema)) {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name() != DATA_FILE {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.extract_dir) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if let Some(t) = TableEntry::from_data_path(&rel) {
                entries.push(t);
            }
        }
        Ok(entries)
    }

    fn tables_in_archive(&self, schema: &str) -> Result<Vec<TableEntry>, SourceError> {
        let mut entries = Vec::new();
        self.for_each_member(|path, _| {
            if let Some(t) = TableEntry::from_data_path(path) {
                if t.schema == schema {
                    entries.push(t);
                }
            }
            Ok(true)
        })?;
        Ok(entries)
    }

    /// Contents of an export file, extracted tree first, then the archive.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn read(&self, rel_path: &str) -> Option<String> {
        let on_disk = self.extract_dir.join(rel_path);
        if on_disk.is_file() {
            return match fs::read(&on_disk) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    debug!("Read: {}: {}", on_disk.display(), e);
                    None
                }
            };
        }
        if !self.has_archive() {
            return None;
        }
        let mut content = None;
        let res = self.for_each_member(|path, entry| {
            if path.trim_start_matches("./") != rel_path {
                return Ok(true);
            }
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            content = Some(String::from_utf8_lossy(&bytes).into_owned());
            Ok(false)
        });
        if let Err(e) = res {
            debug!("Read: {} from archive: {}", rel_path, e);
        }
        content
    }

    /// Unpack the schema's table files into the extraction directory.
    /// Returns how many files were written.
    pub fn extract(&self, schema: &str) -> Result<usize, SourceError> {
        let prefix = format!("index/{}/", schema);
        let dest = self.extract_dir.clone();
        fs::create_dir_all(&dest).map_err(|source| SourceError::Archive {
            path: dest.clone(),
            source,
        })?;
        let mut written = 0usize;
        self.for_each_member(|path, entry| {
            let path = path.trim_start_matches("./");
            let wanted = path.starts_with(&prefix)
                && (path.ends_with(DATA_FILE) || path.ends_with(DDL_FILE) || path.ends_with(XML_FILE));
            if wanted && entry.unpack_in(&dest)? {
                written += 1;
            }
            Ok(true)
        })?;
        info!("Extracted {} files for schema {} into {}", written, schema, dest.display());
        Ok(written)
    }

    /// Extract unless the schema is already unpacked.
    pub fn ensure_extracted(&self, schema: &str) -> Result<(), SourceError> {
        if self.is_extracted(schema) {
            debug!("EnsureExtracted: {} already extracted", schema);
            return Ok(());
        }
        if self.has_archive() {
            self.extract(schema)?;
        }
        Ok(())
    }

    // Stream archive members; the visitor returns Ok(false) to stop early.
    fn for_each_member<F>(&self, mut visit: F) -> Result<(), SourceError>
    where
        F: FnMut(&str, &mut tar::Entry<'_, GzDecoder<File>>) -> std::io::Result<bool>,
    {
        let wrap = |source| SourceError::Archive {
            path: self.archive.clone(),
            source,
        };
        let file = File::open(&self.archive).map_err(wrap)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        for entry in archive.entries().map_err(wrap)? {
            let mut entry = entry.map_err(wrap)?;
            let path = entry.path().map_err(wrap)?.to_string_lossy().into_owned();
            if !visit(&path, &mut entry).map_err(wrap)? {
                break;
            }
        }
        Ok(())
    }
}

/// Source schema name: configured value, else detection from the export.
pub fn resolve_schema_name(
    configured: Option<&str>,
    source: &ExportSource,
) -> Result<String, SourceError> {
    if let Some(s) = configured {
        return Ok(s.to_string());
    }
    let schema = source.detect_schema().ok_or(SourceError::NoSchema)?;
    info!("Detected export schema {}", schema);
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, body) in files {
            let p = root.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
    }

    fn write_archive(path: &Path, files: &[(&str, &str)]) {
        let gz = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (rel, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, rel, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    const FILES: &[(&str, &str)] = &[
        ("index/SALES/AB/ORDERS/data.csv", "1,a\n"),
        ("index/SALES/AB/ORDERS/create.sql", "CREATE TABLE ORDERS (ID INT)"),
        ("index/SALES/AB/ORDERS/table.xml", "<x/>"),
        ("index/SALES/CD/CUSTOMERS/data.csv", "2,b\n"),
        ("index/SALES/CD/CUSTOMERS/create.sql", "CREATE TABLE CUSTOMERS (ID INT)"),
    ];

    #[test]
    fn parses_table_paths() {
        let t = TableEntry::from_data_path("./index/S/C/T/data.csv").unwrap();
        assert_eq!(t.table, "T");
        assert_eq!(t.ddl_path(), "index/S/C/T/create.sql");
        assert!(TableEntry::from_data_path("index/S/T/data.csv").is_none());
        assert!(TableEntry::from_data_path("index/S/C/T/create.sql").is_none());
    }

    #[test]
    fn reads_extracted_tree() {
        let dir = tempfile::tempdir().unwrap();
        let extracted = dir.path().join("x");
        write_tree(&extracted, FILES);

        let src = ExportSource::open(&dir.path().join("missing.tar.gz"), &extracted).unwrap();
        assert_eq!(src.detect_schema().as_deref(), Some("SALES"));
        let tables: Vec<String> = src
            .tables("SALES")
            .unwrap()
            .into_iter()
            .map(|t| t.table)
            .collect();
        assert_eq!(tables, vec!["CUSTOMERS", "ORDERS"]);
        assert_eq!(
            src.read("index/SALES/AB/ORDERS/data.csv").as_deref(),
            Some("1,a\n")
        );
        assert!(src.read("index/SALES/AB/NOPE/data.csv").is_none());
    }

    #[test]
    fn reads_and_extracts_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("export.tar.gz");
        write_archive(&archive, FILES);
        let extracted = dir.path().join("out");

        let src = ExportSource::open(&archive, &extracted).unwrap();
        assert_eq!(src.detect_schema().as_deref(), Some("SALES"));
        assert!(!src.is_extracted("SALES"));
        assert_eq!(src.tables("SALES").unwrap().len(), 2);
        assert_eq!(
            src.read("index/SALES/CD/CUSTOMERS/create.sql").as_deref(),
            Some("CREATE TABLE CUSTOMERS (ID INT)")
        );

        assert_eq!(src.extract("SALES").unwrap(), 5);
        assert!(src.is_extracted("SALES"));
        assert!(extracted.join("index/SALES/AB/ORDERS/table.xml").is_file());
    }

    #[test]
    fn missing_export_and_schema_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExportSource::open(&dir.path().join("a.tar.gz"), &dir.path().join("b"));
        assert!(matches!(err, Err(SourceError::NotFound { .. })));

        let extracted = dir.path().join("x");
        fs::create_dir_all(extracted.join("index")).unwrap();
        let src = ExportSource::open(&dir.path().join("a.tar.gz"), &extracted).unwrap();
        assert_eq!(resolve_schema_name(Some("FIXED"), &src).unwrap(), "FIXED");
        assert!(matches!(
            resolve_schema_name(None, &src),
            Err(SourceError::NoSchema)
        ));
    }
}
