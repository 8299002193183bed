pub mod columns;

use crate::config::SinkConfig;
use crate::error::{Result, SmartError};
use crate::models::{PartitionKey, Record};
use chrono::NaiveDate;
use duckdb::{Connection, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use self::columns::{Column, ColumnChange, plan_column_changes, quote_ident, to_sql_value};

/// Field holding the report date in every sitrep row.
pub const REPORT_DATE_FIELD: &str = "reportDate";
/// Field holding the site hash in every sitrep row.
pub const SITE_ID_FIELD: &str = "siteId";

// ── Sink traits ───────────────────────────────────────────────────────────────

/// Something the loader can open a fresh connection to.
pub trait Sink: Send + Sync {
    type Connection: SinkConnection;

    fn connect(&self) -> Result<Self::Connection>;
}

/// One open connection to the destination table.
pub trait SinkConnection {
    fn table_exists(&self) -> Result<bool>;

    fn create_table(&self, columns: &[Column]) -> Result<()>;

    /// Add missing columns and widen existing ones so `columns` can be inserted.
    fn sync_columns(&self, columns: &[Column]) -> Result<()>;

    /// Delete rows of one partition. Returns the number removed.
    fn delete_partition(&self, key: &PartitionKey) -> Result<usize>;

    /// Append `records` in multi-row INSERTs of at most `chunk_size` rows.
    fn insert_rows(&self, columns: &[Column], records: &[Record], chunk_size: usize) -> Result<usize>;
}

// ── DuckDB sink ───────────────────────────────────────────────────────────────

enum Location {
    File(PathBuf),
    /// Shared in-memory database; every connect clones the handle.
    Memory(Mutex<Connection>),
}

pub struct DuckDbSink {
    location: Location,
    schema: String,
    table: String,
}

impl DuckDbSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            location: Location::File(config.db_path.clone()),
            schema: config.schema.clone(),
            table: config.table.clone(),
        }
    }

    pub fn in_memory(schema: &str, table: &str) -> Result<Self> {
        Ok(Self {
            location: Location::Memory(Mutex::new(Connection::open_in_memory()?)),
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }
}

impl Sink for DuckDbSink {
    type Connection = Repository;

    fn connect(&self) -> Result<Repository> {
        let conn = match &self.location {
            Location::File(path) => open_file(path)?,
            Location::Memory(shared) => shared
                .lock()
                .map_err(|_| SmartError::Sink("in-memory connection poisoned".into()))?
                .try_clone()?,
        };
        Ok(Repository {
            conn,
            schema: self.schema.clone(),
            table: self.table.clone(),
        })
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| SmartError::Sink(format!("could not create {parent:?}: {e}")))?;
    }
    Ok(Connection::open(path)?)
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
    schema: String,
    table: String,
}

impl Repository {
    fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// `YYYY-MM-DD` prefix of the report date, whatever type the column has.
    fn report_day_expr() -> String {
        format!("substr(CAST({} AS VARCHAR), 1, 10)", quote_ident(REPORT_DATE_FIELD))
    }

    pub fn row_count(&self) -> Result<i64> {
        if !self.table_exists()? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", self.qualified_table());
        Ok(self.conn.query_row(&sql, [], |r| r.get(0))?)
    }

    pub fn partition_count(&self, key: &PartitionKey) -> Result<i64> {
        if !self.table_exists()? {
            return Ok(0);
        }
        let day = Self::report_day_expr();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {day} >= ? AND {day} <= ? AND CAST({} AS VARCHAR) = ?",
            self.qualified_table(),
            quote_ident(SITE_ID_FIELD),
        );
        Ok(self.conn.query_row(
            &sql,
            params![iso(key.window.start), iso(key.window.end), key.site.as_str()],
            |r| r.get(0),
        )?)
    }

    /// `(column_name, data_type)` of the table, in table order.
    pub fn columns(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns
             WHERE table_schema = ? AND table_name = ?
             ORDER BY ordinal_position",
        )?;
        let rows = stmt.query_map(params![self.schema, self.table], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Earliest and latest report dates held in the table.
    pub fn date_range(&self) -> Result<(Option<String>, Option<String>)> {
        if !self.table_exists()? {
            return Ok((None, None));
        }
        let day = Self::report_day_expr();
        let sql = format!("SELECT MIN({day}), MAX({day}) FROM {}", self.qualified_table());
        Ok(self.conn.query_row(&sql, [], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl SinkConnection for Repository {
    fn table_exists(&self) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
            params![self.schema, self.table],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn create_table(&self, columns: &[Column]) -> Result<()> {
        if columns.is_empty() {
            return Err(SmartError::Sink(format!(
                "cannot create {} without columns",
                self.qualified_table()
            )));
        }
        let defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.sql_type().sql()))
            .collect();
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {};\nCREATE TABLE IF NOT EXISTS {} ({});",
            quote_ident(&self.schema),
            self.qualified_table(),
            defs.join(", "),
        );
        debug!("{}", ddl);
        self.conn.execute_batch(&ddl)?;
        Ok(())
    }

    fn sync_columns(&self, columns: &[Column]) -> Result<()> {
        let changes = plan_column_changes(&self.columns()?, columns);
        for change in &changes {
            let ddl = match change {
                ColumnChange::Add { name, ty } => format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    self.qualified_table(),
                    quote_ident(name),
                    ty.sql()
                ),
                ColumnChange::Widen { name, to, .. } => format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                    self.qualified_table(),
                    quote_ident(name),
                    to.sql()
                ),
            };
            info!("{}: {}", self.qualified_table(), change);
            self.conn.execute_batch(&ddl)?;
        }
        Ok(())
    }

    fn delete_partition(&self, key: &PartitionKey) -> Result<usize> {
        let day = Self::report_day_expr();
        let sql = format!(
            "DELETE FROM {} WHERE {day} >= ? AND {day} <= ? AND CAST({} AS VARCHAR) = ?",
            self.qualified_table(),
            quote_ident(SITE_ID_FIELD),
        );
        let deleted = self.conn.execute(
            &sql,
            params![iso(key.window.start), iso(key.window.end), key.site.as_str()],
        )?;
        Ok(deleted)
    }

    fn insert_rows(&self, columns: &[Column], records: &[Record], chunk_size: usize) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        if chunk_size == 0 {
            return Err(SmartError::config("chunk size must be positive"));
        }

        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let mut inserted = 0usize;

        for (i, chunk) in records.chunks(chunk_size).enumerate() {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.qualified_table(),
                names.join(", "),
                vec![placeholders.as_str(); chunk.len()].join(", "),
            );
            let values = chunk
                .iter()
                .flat_map(|record| columns.iter().map(|c| to_sql_value(record.get(&c.name))));

            inserted += self.conn.execute(&sql, params_from_iter(values))?;
            debug!("chunk {}: {} rows into {}", i + 1, chunk.len(), self.qualified_table());
        }

        Ok(inserted)
    }
}
