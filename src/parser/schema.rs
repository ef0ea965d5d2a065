// DDL parser: extracts column definitions and PRIMARY KEY columns from a
// table's CREATE TABLE statement.
// Like the dump parsers this favors speed over a full SQL grammar: columns are
// recognised as `name TYPE` pairs drawn from a fixed type vocabulary.

use crate::error::SchemaError;
use regex::Regex;
use tracing::debug;

// Words that look like column names in DDL but are table clauses.
const STRUCTURAL_KEYWORDS: &[&str] = &[
    "PRIMARY", "KEY", "INVERTED", "VALUE", "UNLOAD", "PRIORITY", "AUTO", "MERGE",
];

/// One declared column, in DDL order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub source_type: String,
}

/// Columns and primary key of one table, derived from its DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Option<Vec<String>>,
}

impl TableSpec {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Positions of the primary-key columns, or `None` when there is no key
    /// or any key column is not among the parsed columns.
    pub fn primary_key_positions(&self) -> Option<Vec<usize>> {
        let pk = self.primary_key.as_ref()?;
        let mut idx = Vec::with_capacity(pk.len());
        for col in pk {
            match self.columns.iter().position(|c| &c.name == col) {
                Some(i) => idx.push(i),
                None => {
                    debug!(
                        "TableSpec: {} primary key column {} not among parsed columns",
                        self.name, col
                    );
                    return None;
                }
            }
        }
        if idx.is_empty() {
            None
        } else {
            Some(idx)
        }
    }
}

pub struct SchemaParser {
    create_table_re: Regex,
    clause_cut_re: Regex,
    column_re: Regex,
    primary_key_re: Regex,
    identifier_re: Regex,
}

impl Default for SchemaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaParser {
    // Build regexes once for reuse.
    pub fn new() -> Self {
        let create_table_re = Regex::new(
            r"(?is)CREATE\s+(?:(?:COLUMN|ROW|GLOBAL\s+TEMPORARY|LOCAL\s+TEMPORARY)\s+)?TABLE\s+[^(]+\((.+)\)",
        )
        .expect("valid create table regex");
        let clause_cut_re = Regex::new(r"(?i)\b(?:PRIMARY\s+KEY|UNLOAD|AUTO|MERGE)\b")
            .expect("valid clause regex");
        let column_re = Regex::new(
            r#"(?i)["']?([A-Z_$][A-Z0-9_$]*?)["']?\s+(NVARCHAR|VARCHAR|NCHAR|CHAR|INTEGER|INT|BIGINT|DECIMAL|DOUBLE|REAL|FLOAT|SECONDDATE|LONGDATE|TIMESTAMP|DATE|TIME|BINARY|VARBINARY|BOOLEAN|TINYINT|SMALLINT|CLOB|NCLOB|BLOB)\b(\s*\([^)]*\))?"#,
        )
        .expect("valid column regex");
        let primary_key_re = Regex::new(
            r"(?i)PRIMARY\s+KEY\s*(?:(?:INVERTED\s+(?:VALUE|HASH|INDIVIDUAL)|CPBTREE|BTREE)\s*)?\(([^)]+)\)",
        )
        .expect("valid primary key regex");
        let identifier_re =
            Regex::new(r#"(?i)["']?([A-Z_$][A-Z0-9_$]*)["']?"#).expect("valid identifier regex");
        Self {
            create_table_re,
            clause_cut_re,
            column_re,
            primary_key_re,
            identifier_re,
        }
    }

    /// Ordered column definitions, or `None` when nothing column-shaped parses.
    pub fn parse_columns(&self, ddl: &str) -> Option<Vec<ColumnDef>> {
        let section = self.create_table_re.captures(ddl)?.get(1)?.as_str();
        let section = match self.clause_cut_re.find(section) {
            Some(m) => &section[..m.start()],
            None => section,
        };

        let mut columns = Vec::new();
        for cap in self.column_re.captures_iter(section) {
            let name = match cap.get(1) {
                Some(m) => m.as_str(),
                None => continue,
            };
            if name.starts_with('$') || is_structural(name) {
                continue;
            }
            let mut source_type = cap
                .get(2)
                .map(|m| m.as_str().to_uppercase())
                .unwrap_or_default();
            if let Some(params) = cap.get(3) {
                source_type.push_str(&params.as_str().split_whitespace().collect::<String>());
            }
            columns.push(ColumnDef {
                name: name.to_string(),
                source_type,
            });
        }

        if columns.is_empty() {
            None
        } else {
            Some(columns)
        }
    }

    /// Primary-key column names in declaration order, if a key clause exists.
    pub fn parse_primary_key(&self, ddl: &str) -> Option<Vec<String>> {
        let list = self.primary_key_re.captures(ddl)?.get(1)?.as_str();
        let mut pk_cols = Vec::new();
        for part in list.split(',') {
            if let Some(cap) = self.identifier_re.captures(part.trim()) {
                if let Some(col) = cap.get(1) {
                    if !is_structural(col.as_str()) {
                        pk_cols.push(col.as_str().to_string());
                    }
                }
            }
        }
        if pk_cols.is_empty() {
            None
        } else {
            Some(pk_cols)
        }
    }

    /// Parse one table's DDL. A missing primary key is not an error.
    pub fn parse_table(&self, name: &str, ddl: &str) -> Result<TableSpec, SchemaError> {
        let columns = self
            .parse_columns(ddl)
            .ok_or_else(|| SchemaError::NoColumns(name.to_string()))?;
        let primary_key = self.parse_primary_key(ddl);
        debug!(
            "ParseTable: {} has {} columns, primary key {:?}",
            name,
            columns.len(),
            primary_key
        );
        Ok(TableSpec {
            name: name.to_string(),
            columns,
            primary_key,
        })
    }
}

fn is_structural(name: &str) -> bool {
    STRUCTURAL_KEYWORDS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ORDERS_DDL: &str = r#"CREATE COLUMN TABLE "SALES"."ORDERS" (
        "ID" INTEGER CS_INT NOT NULL,
        "CUSTOMER" NVARCHAR(100),
        "AMOUNT" DECIMAL(15, 2),
        "CREATED_AT" SECONDDATE,
        PRIMARY KEY INVERTED VALUE ("ID", "CUSTOMER")
    ) UNLOAD PRIORITY 5 AUTO MERGE"#;

    #[test]
    fn parses_columns_in_order_with_types() {
        let spec = SchemaParser::new().parse_table("ORDERS", ORDERS_DDL).unwrap();
        let cols: Vec<(&str, &str)> = spec
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.source_type.as_str()))
            .collect();
        assert_eq!(
            cols,
            vec![
                ("ID", "INTEGER"),
                ("CUSTOMER", "NVARCHAR(100)"),
                ("AMOUNT", "DECIMAL(15,2)"),
                ("CREATED_AT", "SECONDDATE"),
            ]
        );
        assert_eq!(
            spec.primary_key,
            Some(vec!["ID".to_string(), "CUSTOMER".to_string()])
        );
        assert_eq!(spec.primary_key_positions(), Some(vec![0, 1]));
    }

    #[test]
    fn plain_primary_key_clause() {
        let ddl = "CREATE TABLE T (A INT, B VARCHAR(10), PRIMARY KEY (A))";
        let parser = SchemaParser::new();
        assert_eq!(parser.parse_primary_key(ddl), Some(vec!["A".to_string()]));
        assert_eq!(parser.parse_columns(ddl).unwrap().len(), 2);
    }

    #[test]
    fn missing_primary_key_is_not_an_error() {
        let ddl = r#"CREATE COLUMN TABLE "S"."LOG" ("MSG" NVARCHAR(500), "AT" TIMESTAMP)"#;
        let spec = SchemaParser::new().parse_table("LOG", ddl).unwrap();
        assert_eq!(spec.primary_key, None);
        assert_eq!(spec.primary_key_positions(), None);
        assert_eq!(spec.columns[1].source_type, "TIMESTAMP");
    }

    #[test]
    fn no_columns_is_reported() {
        let parser = SchemaParser::new();
        assert_eq!(
            parser.parse_table("X", "CREATE TABLE X (FOO GEOMETRY)"),
            Err(SchemaError::NoColumns("X".to_string()))
        );
        assert!(parser.parse_columns("not ddl at all").is_none());
    }

    #[test]
    fn structural_and_system_names_are_skipped() {
        let ddl = r#"CREATE COLUMN TABLE T ("$rowid$" BIGINT, "ID" INT, "AUTO_ID" BIGINT)"#;
        let cols = SchemaParser::new().parse_columns(ddl).unwrap();
        let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "AUTO_ID"]);
    }

    #[test]
    fn primary_key_outside_columns_has_no_positions() {
        let spec = TableSpec {
            name: "T".to_string(),
            columns: vec![ColumnDef {
                name: "A".to_string(),
                source_type: "INT".to_string(),
            }],
            primary_key: Some(vec!["A".to_string(), "MISSING".to_string()]),
        };
        assert_eq!(spec.primary_key_positions(), None);
    }
}
