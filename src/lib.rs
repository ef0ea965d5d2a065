// hdbimport: load exported table data (DDL + CSV) into a HANA-style database
// through its command-line client, skipping rows that already exist.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod generate;
pub mod importer;
pub mod logger;
pub mod parser;
pub mod progress;
pub mod reconcile;
pub mod script;
pub mod source;

pub use client::{HdbClient, SqlClient};
pub use config::{Config, RawConfig};
pub use error::{ImportError, Result};
