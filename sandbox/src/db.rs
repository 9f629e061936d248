use std::fmt::Write;
use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgRow, PgValueFormat};
use sqlx::{Column, Executor, PgPool, Row, TypeInfo, ValueRef};
use tracing::{info, instrument, warn};

use crate::errors::{Result, SandboxError};

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const NOT_CONFIGURED: &str =
    "DATABASE_URL is not configured or the database connection failed";
pub const NO_ROWS: &str = "Query executed successfully. No rows returned.";

const COLUMNS_QUERY: &str = r#"
SELECT table_schema::text AS table_schema,
       table_name::text AS table_name,
       column_name::text AS column_name,
       data_type::text AS data_type,
       is_nullable::text AS is_nullable,
       column_default::text AS column_default
FROM information_schema.columns
WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
ORDER BY table_schema, table_name, ordinal_position
"#;

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub sample_rows: usize,
    pub read_only: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            sample_rows: 3,
            read_only: false,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
    sample_rows: usize,
    read_only: bool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await?;
        Ok(Self {
            pool,
            sample_rows: config.sample_rows,
            read_only: config.read_only,
        })
    }

    #[instrument(skip(self))]
    pub async fn schema(&self) -> Result<String> {
        let rows = sqlx::query(COLUMNS_QUERY).fetch_all(&self.pool).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                table_schema: row.try_get("table_schema")?,
                table_name: row.try_get("table_name")?,
                column_name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get::<String, _>("is_nullable")? == "YES",
                default: row.try_get("column_default")?,
            });
        }

        let mut tables = group_tables(columns);
        if self.sample_rows > 0 {
            for table in &mut tables {
                let sql = format!(
                    "SELECT * FROM {} LIMIT {}",
                    table.qualified_name(),
                    self.sample_rows
                );
                match self.pool.fetch_all(sql.as_str()).await {
                    Ok(rows) => table.samples = Some(render_tab_separated(&rows)),
                    Err(err) => warn!(table = %table.name, %err, "failed to sample rows"),
                }
            }
        }
        Ok(render_schema(&tables))
    }

    /// Runs `query` verbatim. Statements are not inspected; with `read_only`
    /// the query runs inside a read-only transaction that is rolled back.
    #[instrument(skip(self))]
    pub async fn query(&self, query: &str) -> Result<String> {
        let rows = if self.read_only {
            let mut tx = self.pool.begin().await?;
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await?;
            let rows = (&mut *tx).fetch_all(query).await;
            tx.rollback().await?;
            rows?
        } else {
            self.pool.fetch_all(query).await?
        };
        info!(rows = rows.len(), "query finished");
        Ok(render_rows(&rows))
    }
}

/// The optional database behind the data access tools.
///
/// Built once at startup; a missing URL or failed connection leaves it
/// absent for the rest of the process.
#[derive(Clone, Debug, Default)]
pub struct DataAccess {
    database: Option<Database>,
}

impl DataAccess {
    pub fn disabled() -> Self {
        Self { database: None }
    }

    pub fn new(database: Database) -> Self {
        Self {
            database: Some(database),
        }
    }

    pub async fn from_config(config: Option<DatabaseConfig>) -> Self {
        let Some(config) = config else {
            info!("{DATABASE_URL_ENV} not set, data access tools disabled");
            return Self::disabled();
        };
        match Database::connect(&config).await {
            Ok(database) => Self::new(database),
            Err(err) => {
                warn!(%err, "could not initialize database connection");
                Self::disabled()
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.database.is_some()
    }

    pub async fn get_db_schema(&self) -> Result<String> {
        self.database()?.schema().await
    }

    pub async fn run_sql_query(&self, query: &str) -> Result<String> {
        self.database()?.query(query).await
    }

    fn database(&self) -> Result<&Database> {
        self.database
            .as_ref()
            .ok_or_else(|| SandboxError::Configuration(NOT_CONFIGURED.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub samples: Option<String>,
}

impl TableInfo {
    fn display_name(&self) -> String {
        if self.schema == "public" {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }

    fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

/// Groups columns (already ordered by schema, table, position) into tables.
pub fn group_tables(columns: Vec<ColumnInfo>) -> Vec<TableInfo> {
    let mut tables: Vec<TableInfo> = Vec::new();
    for column in columns {
        let same_table = tables.last().is_some_and(|table| {
            table.schema == column.table_schema && table.name == column.table_name
        });
        if !same_table {
            tables.push(TableInfo {
                schema: column.table_schema.clone(),
                name: column.table_name.clone(),
                columns: Vec::new(),
                samples: None,
            });
        }
        if let Some(table) = tables.last_mut() {
            table.columns.push(column);
        }
    }
    tables
}

pub fn render_schema(tables: &[TableInfo]) -> String {
    if tables.is_empty() {
        return "No tables found.".to_string();
    }
    let mut out = String::new();
    for (idx, table) in tables.iter().enumerate() {
        if idx > 0 {
            out.push_str("\n\n");
        }
        let _ = writeln!(out, "CREATE TABLE {} (", table.display_name());
        let lines: Vec<String> = table
            .columns
            .iter()
            .map(|column| {
                let mut line = format!("\t{} {}", column.column_name, column.data_type);
                if !column.nullable {
                    line.push_str(" NOT NULL");
                }
                if let Some(default) = &column.default {
                    let _ = write!(line, " DEFAULT {default}");
                }
                line
            })
            .collect();
        out.push_str(&lines.join(",\n"));
        out.push_str("\n)");
        if let Some(samples) = &table.samples {
            let count = samples.lines().count().saturating_sub(1);
            let _ = write!(
                out,
                "\n\n/*\n{count} rows from {} table:\n{samples}\n*/",
                table.display_name()
            );
        }
    }
    out
}

fn render_rows(rows: &[PgRow]) -> String {
    let Some(first) = rows.first() else {
        return NO_ROWS.to_string();
    };
    let mut out = first
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect::<Vec<_>>()
        .join(" | ");
    for row in rows {
        out.push('\n');
        out.push_str(&row_cells(row).join(" | "));
    }
    let _ = write!(out, "\n({} rows)", rows.len());
    out
}

fn render_tab_separated(rows: &[PgRow]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    if let Some(first) = rows.first() {
        lines.push(
            first
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect::<Vec<_>>()
                .join("\t"),
        );
    }
    for row in rows {
        lines.push(row_cells(row).join("\t"));
    }
    lines.join("\n")
}

fn row_cells(row: &PgRow) -> Vec<String> {
    (0..row.len()).map(|idx| render_cell(row, idx)).collect()
}

// Unprepared queries come back in text format, so every column has a printable form.
fn render_cell(row: &PgRow, idx: usize) -> String {
    let value = match row.try_get_raw(idx) {
        Ok(value) => value,
        Err(err) => return format!("<{err}>"),
    };
    if value.is_null() {
        return "NULL".to_string();
    }
    let type_name = value.type_info().name().to_string();
    if value.format() == PgValueFormat::Binary {
        return format!("<{type_name}>");
    }
    match value.as_str() {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{type_name}>"),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
