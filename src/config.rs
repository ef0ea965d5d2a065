//! Configuration resolution.
//!
//! Settings are plain `KEY=value` pairs. Each key is looked up in order:
//! explicit value (CLI flag) → environment variable → config file → built-in
//! default. Resolution happens once at startup into an immutable [`Config`].

use crate::error::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "hana_config.conf";

const CONNECTION_KEYS: [&str; 4] = ["HANA_HOST", "HANA_PORT", "HANA_USER", "HANA_PASSWORD"];

/// Layered key → optional-string mapping.
#[derive(Debug, Default, Clone)]
pub struct RawConfig {
    overrides: HashMap<String, String>,
    file: HashMap<String, String>,
    use_env: bool,
    source: Option<PathBuf>,
}

impl RawConfig {
    /// Load the config file (if any) and enable environment lookups.
    ///
    /// An explicitly requested file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut raw = RawConfig {
            use_env: true,
            ..Default::default()
        };

        if !path.exists() && !required {
            tracing::debug!("no config file at {}, using environment only", path.display());
            return Ok(raw);
        }

        let iter = dotenvy::from_path_iter(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        for item in iter {
            let (key, value) = item.map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            raw.file.insert(key, value);
        }
        tracing::debug!("loaded {} settings from {}", raw.file.len(), path.display());
        raw.source = Some(path);
        Ok(raw)
    }

    /// Build from in-memory pairs without consulting the environment.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        RawConfig {
            file: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Default::default()
        }
    }

    /// Record an explicit (highest precedence) value. `None` leaves the key alone.
    pub fn set_override(&mut self, key: &str, value: Option<String>) {
        if let Some(v) = value {
            self.overrides.insert(key.to_string(), v);
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Look up a key. Empty strings count as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.overrides.get(key) {
            return non_empty(v);
        }
        if self.use_env {
            if let Ok(v) = std::env::var(key) {
                if let Some(v) = non_empty(&v) {
                    return Some(v);
                }
            }
        }
        self.file.get(key).and_then(|v| non_empty(v))
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }
}

fn non_empty(v: &str) -> Option<String> {
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

/// Connection parameters for the external client.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl ConnectionParams {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Concurrency and pagination knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub page_size: usize,
    pub compare_workers: usize,
    pub insert_workers: usize,
    pub poll_interval: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            page_size: 1000,
            compare_workers: 5,
            insert_workers: 10,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Fully resolved, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    connection: Option<ConnectionParams>,
    missing_connection_key: Option<&'static str>,
    pub client_path: Option<PathBuf>,
    pub sql_timeout: Option<Duration>,
    pub source_schema: Option<String>,
    target_schema: Option<String>,
    pub table_prefix: String,
    pub export_archive: PathBuf,
    pub extract_dir: PathBuf,
    pub error_log_dir: PathBuf,
    pub sql_dir: PathBuf,
    pub log_dir: PathBuf,
    pub created_dir: PathBuf,
    pub tunables: Tunables,
}

impl Config {
    /// Resolve every setting, collecting all validation errors at once.
    pub fn resolve(raw: &RawConfig) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let port = parse_setting::<u16>(raw, "HANA_PORT", &mut errors);
        let missing_connection_key = CONNECTION_KEYS.into_iter().find(|k| raw.get(k).is_none());
        let connection = match (missing_connection_key, port) {
            (None, Some(port)) => Some(ConnectionParams {
                host: raw.get("HANA_HOST").unwrap_or_default(),
                port,
                user: raw.get("HANA_USER").unwrap_or_default(),
                password: raw.get("HANA_PASSWORD").unwrap_or_default(),
                database: raw.get("HANA_DATABASE"),
            }),
            _ => None,
        };

        let sql_timeout =
            parse_setting::<u64>(raw, "SQL_TIMEOUT", &mut errors).map(Duration::from_secs);

        let defaults = Tunables::default();
        let tunables = Tunables {
            page_size: parse_setting(raw, "PAGE_SIZE", &mut errors).unwrap_or(defaults.page_size),
            compare_workers: parse_setting(raw, "COMPARE_WORKERS", &mut errors)
                .unwrap_or(defaults.compare_workers),
            insert_workers: parse_setting(raw, "INSERT_WORKERS", &mut errors)
                .unwrap_or(defaults.insert_workers),
            poll_interval: parse_setting::<u64>(raw, "POLL_INTERVAL_MS", &mut errors)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        };
        if tunables.page_size == 0 {
            errors.push("PAGE_SIZE must be positive".to_string());
        }
        if tunables.compare_workers == 0 {
            errors.push("COMPARE_WORKERS must be positive".to_string());
        }
        if tunables.insert_workers == 0 {
            errors.push("INSERT_WORKERS must be positive".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(Config {
            connection,
            missing_connection_key,
            client_path: raw.get("HANA_CLIENT_PATH").map(PathBuf::from),
            sql_timeout,
            source_schema: raw.get("SCHEMA"),
            target_schema: raw.get("TARGET_SCHEMA"),
            table_prefix: raw.get_or("TABLE_PREFIX", "DB_"),
            export_archive: PathBuf::from(raw.get_or("EXPORT_TAR_FILE", "export.tar.gz")),
            extract_dir: PathBuf::from(raw.get_or("EXTRACT_DIR", "temp_extract")),
            error_log_dir: PathBuf::from(raw.get_or("ERROR_LOG_DIR", "error_logs")),
            sql_dir: PathBuf::from(raw.get_or("SQL_DIR", "data_insert_sql")),
            log_dir: PathBuf::from(raw.get_or("LOG_DIR", "logs")),
            created_dir: PathBuf::from(raw.get_or("CREATED_DIR", "created")),
            tunables,
        })
    }

    /// Connection parameters, or the first missing required key.
    pub fn require_connection(&self) -> Result<&ConnectionParams, ConfigError> {
        match &self.connection {
            Some(c) => Ok(c),
            None => Err(ConfigError::Missing(
                self.missing_connection_key.unwrap_or("HANA_PORT"),
            )),
        }
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Schema that owns the target tables: explicit, else derived from the user.
    pub fn target_schema(&self) -> Option<String> {
        self.target_schema.clone().or_else(|| {
            self.connection
                .as_ref()
                .and_then(|c| schema_from_user(&c.user))
        })
    }

    /// Target table name for a source table.
    pub fn target_table(&self, table: &str) -> String {
        format!("{}{}", self.table_prefix, table)
    }
}

fn parse_setting<T: std::str::FromStr>(
    raw: &RawConfig,
    key: &str,
    errors: &mut Vec<String>,
) -> Option<T> {
    let value = raw.get(key)?;
    match value.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(format!("{} has invalid value '{}'", key, value));
            None
        }
    }
}

/// Derive the schema name from a technical user name.
///
/// `SCHEMA_XXXX_RT` → `SCHEMA`, `SCHEMA_XXXX` → `SCHEMA`, `SCHEMA` → `SCHEMA`.
pub fn schema_from_user(user: &str) -> Option<String> {
    if user.is_empty() {
        return None;
    }
    let parts: Vec<&str> = user.split('_').collect();
    let schema = match parts.len() {
        1 => user.to_string(),
        2 => parts[0].to_string(),
        n => parts[..n - 2].join("_"),
    };
    if schema.is_empty() {
        None
    } else {
        Some(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> RawConfig {
        RawConfig::from_pairs([
            ("HANA_HOST", "db.example"),
            ("HANA_PORT", "443"),
            ("HANA_USER", "SALES_1A2B_RT"),
            ("HANA_PASSWORD", "secret"),
        ])
    }

    #[test]
    fn resolves_defaults() {
        let cfg = Config::resolve(&full()).unwrap();
        let conn = cfg.require_connection().unwrap();
        assert_eq!(conn.endpoint(), "db.example:443");
        assert_eq!(cfg.table_prefix, "DB_");
        assert_eq!(cfg.tunables, Tunables::default());
        assert_eq!(cfg.sql_timeout, None);
        assert_eq!(cfg.target_schema().as_deref(), Some("SALES"));
        assert_eq!(cfg.target_table("ORDERS"), "DB_ORDERS");
    }

    #[test]
    fn explicit_value_beats_file() {
        let mut raw = full();
        raw.set_override("TARGET_SCHEMA", Some("OTHER".to_string()));
        raw.set_override("TABLE_PREFIX", None);
        let cfg = Config::resolve(&raw).unwrap();
        assert_eq!(cfg.target_schema().as_deref(), Some("OTHER"));
        assert_eq!(cfg.table_prefix, "DB_");
    }

    #[test]
    fn missing_connection_is_reported_lazily() {
        let raw = RawConfig::from_pairs([("HANA_HOST", "h"), ("HANA_PORT", "30015")]);
        let cfg = Config::resolve(&raw).unwrap();
        assert!(!cfg.has_connection());
        match cfg.require_connection() {
            Err(ConfigError::Missing(key)) => assert_eq!(key, "HANA_USER"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn collects_all_invalid_numbers() {
        let mut raw = full();
        raw.set_override("PAGE_SIZE", Some("lots".to_string()));
        raw.set_override("INSERT_WORKERS", Some("0".to_string()));
        match Config::resolve(&raw) {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("PAGE_SIZE"));
                assert!(errors[1].contains("INSERT_WORKERS"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn loads_dotenv_style_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hana_config.conf");
        std::fs::write(
            &path,
            "# comment\nHANA_HOST=h\nHANA_PORT=30015\nSQL_TIMEOUT=\"120\"\n",
        )
        .unwrap();
        let raw = RawConfig::load(Some(&path)).unwrap();
        assert_eq!(raw.source(), Some(path.as_path()));
        assert_eq!(raw.file.get("SQL_TIMEOUT").map(String::as_str), Some("120"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.conf");
        assert!(matches!(
            RawConfig::load(Some(&path)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn schema_from_user_variants() {
        assert_eq!(schema_from_user("SALES_1A2B_RT").as_deref(), Some("SALES"));
        assert_eq!(schema_from_user("MY_SALES_1A2B_RT").as_deref(), Some("MY_SALES"));
        assert_eq!(schema_from_user("SALES_1A2B").as_deref(), Some("SALES"));
        assert_eq!(schema_from_user("SALES").as_deref(), Some("SALES"));
        assert_eq!(schema_from_user(""), None);
    }
}
