//! Live legacy source: a Firebird database read over its wire protocol.
//!
//! `RowQuery` is rendered to Firebird SQL with positional `?` parameters. The driver is
//! blocking, so every statement runs on the blocking pool behind a mutex-guarded
//! connection. Catalog reads go through `rdb$relations` and `rdb$relation_fields`.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveTime;
use rsfbclient::{charset, Charset, Queryable, Row, SimpleConnection, SqlType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Filter, LegacySource, RowQuery, SourceError, SourceRow, SourceValue};

/// User tables, excluding system relations and views.
pub const LIST_TABLES_SQL: &str = "SELECT TRIM(r.RDB$RELATION_NAME) FROM RDB$RELATIONS r \
     WHERE r.RDB$SYSTEM_FLAG = 0 AND r.RDB$VIEW_BLR IS NULL ORDER BY 1";

/// Columns of one relation in declaration order.
pub const LIST_COLUMNS_SQL: &str = "SELECT TRIM(rf.RDB$FIELD_NAME) FROM RDB$RELATION_FIELDS rf \
     WHERE rf.RDB$RELATION_NAME = ? ORDER BY rf.RDB$FIELD_POSITION";

#[derive(Clone, Serialize, Deserialize)]
pub struct FirebirdConfig {
    pub host: String,
    pub port: u16,
    /// Database path or alias as the server sees it.
    pub database: String,
    pub user: String,
    pub password: String,
    pub charset: String,
}

impl fmt::Debug for FirebirdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirebirdConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("charset", &self.charset)
            .finish()
    }
}

impl FirebirdConfig {
    /// `None` unless `FIREBIRD_DB_PATH` is set.
    pub fn from_env() -> Option<Self> {
        let database = std::env::var("FIREBIRD_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Self {
            host: std::env::var("FIREBIRD_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("FIREBIRD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3050),
            database,
            user: std::env::var("FIREBIRD_USER").unwrap_or_else(|_| "SYSDBA".to_string()),
            password: std::env::var("FIREBIRD_PASSWORD")
                .unwrap_or_else(|_| "masterkey".to_string()),
            charset: std::env::var("FIREBIRD_CHARSET").unwrap_or_else(|_| "WIN1252".to_string()),
        })
    }

    pub fn describe(&self) -> String {
        format!("firebird://{}:{}/{}", self.host, self.port, self.database)
    }
}

/// A rendered statement and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<SourceValue>,
}

/// Bare identifiers only; names come from the catalog or rules files and are never quoted.
fn identifier<'a>(table: &str, name: &'a str) -> Result<&'a str, SourceError> {
    let name = name.trim();
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(name)
    } else if name == table {
        Err(SourceError::UnknownTable(table.to_string()))
    } else {
        Err(SourceError::UnknownColumn {
            table: table.to_string(),
            column: name.to_string(),
        })
    }
}

fn render_filter(
    table: &str,
    filter: &Filter,
    params: &mut Vec<SourceValue>,
) -> Result<String, SourceError> {
    let column = identifier(table, filter.column())?;
    Ok(match filter {
        Filter::Eq { value, .. } if value.is_null() => format!("{column} IS NULL"),
        Filter::Eq { value, .. } => {
            params.push(value.clone());
            format!("{column} = ?")
        }
        Filter::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
        Filter::In { values, .. } => {
            params.extend(values.iter().cloned());
            let marks = vec!["?"; values.len()].join(", ");
            format!("{column} IN ({marks})")
        }
        Filter::BetweenDates { from, to, .. } => {
            params.push(SourceValue::Date(*from));
            params.push(SourceValue::Date(*to));
            format!("CAST({column} AS DATE) BETWEEN ? AND ?")
        }
        Filter::Unset { .. } => format!("COALESCE({column}, 0) = 0"),
    })
}

pub fn render_select(query: &RowQuery) -> Result<SqlStatement, SourceError> {
    let table = identifier(&query.table, &query.table)?;
    let mut sql = String::from("SELECT ");
    if let Some(limit) = query.limit {
        sql.push_str(&format!("FIRST {limit} "));
    }
    if query.columns.is_empty() {
        sql.push('*');
    } else {
        let columns = query
            .columns
            .iter()
            .map(|c| identifier(table, c))
            .collect::<Result<Vec<_>, _>>()?;
        sql.push_str(&columns.join(", "));
    }
    sql.push_str(" FROM ");
    sql.push_str(table);

    let mut params = Vec::new();
    if !query.filters.is_empty() {
        let clauses = query
            .filters
            .iter()
            .map(|f| render_filter(table, f, &mut params))
            .collect::<Result<Vec<_>, _>>()?;
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if !query.order_by.is_empty() {
        let keys = query
            .order_by
            .iter()
            .map(|key| {
                let column = identifier(table, &key.column)?;
                let direction = if key.descending { " DESC" } else { "" };
                Ok(format!("{column}{direction} NULLS LAST"))
            })
            .collect::<Result<Vec<_>, SourceError>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }
    Ok(SqlStatement { sql, params })
}

/// Blocking statement execution; the seam between SQL rendering and the driver.
pub trait SqlExecutor: Send + Sync + 'static {
    fn query(&self, sql: &str, params: &[SourceValue]) -> Result<Vec<SourceRow>, SourceError>;
}

/// One driver connection, shared by the run.
pub struct FbConnection {
    conn: Mutex<SimpleConnection>,
}

fn charset_named(name: &str) -> Result<Charset, SourceError> {
    match name.trim().to_ascii_uppercase().replace(['-', '_'], "").as_str() {
        "WIN1252" => Ok(charset::WIN_1252),
        "UTF8" => Ok(charset::UTF_8),
        "ISO88591" => Ok(charset::ISO_8859_1),
        other => Err(anyhow::anyhow!("unsupported firebird charset `{other}`").into()),
    }
}

impl FbConnection {
    pub fn open(config: &FirebirdConfig) -> Result<Self, SourceError> {
        let conn = rsfbclient::builder_pure_rust()
            .host(config.host.as_str())
            .port(config.port)
            .db_name(config.database.as_str())
            .user(config.user.as_str())
            .pass(config.password.as_str())
            .charset(charset_named(&config.charset)?)
            .connect()
            .with_context(|| format!("connecting to {}", config.describe()))?;
        Ok(Self {
            conn: Mutex::new(conn.into()),
        })
    }
}

fn to_sql(value: &SourceValue) -> SqlType {
    match value {
        SourceValue::Null => SqlType::Null,
        SourceValue::Int(v) => SqlType::Integer(*v),
        SourceValue::Float(v) => SqlType::Floating(*v),
        SourceValue::Text(v) => SqlType::Text(v.clone()),
        SourceValue::Date(d) => SqlType::Timestamp(d.and_time(NaiveTime::MIN)),
        SourceValue::Timestamp(ts) => SqlType::Timestamp(*ts),
    }
}

fn from_sql(value: SqlType) -> SourceValue {
    match value {
        SqlType::Text(v) => SourceValue::Text(v),
        SqlType::Integer(v) => SourceValue::Int(v),
        SqlType::Floating(v) => SourceValue::Float(v),
        SqlType::Timestamp(ts) => SourceValue::Timestamp(ts),
        // blobs and booleans carry nothing the mirror reads
        _ => SourceValue::Null,
    }
}

impl SqlExecutor for FbConnection {
    fn query(&self, sql: &str, params: &[SourceValue]) -> Result<Vec<SourceRow>, SourceError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("firebird connection mutex poisoned"))?;
        let rows: Vec<Row> = conn
            .query(sql, params.iter().map(to_sql).collect::<Vec<_>>())
            .with_context(|| format!("running `{sql}`"))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let (columns, values) = row
                    .cols
                    .into_iter()
                    .map(|col| (col.name, from_sql(col.value)))
                    .unzip();
                SourceRow::new(columns, values)
            })
            .collect())
    }
}

pub struct FirebirdSource<E: SqlExecutor = FbConnection> {
    executor: Arc<E>,
    label: String,
}

impl FirebirdSource {
    pub async fn connect(config: &FirebirdConfig) -> Result<Self, SourceError> {
        let owned = config.clone();
        let conn = tokio::task::spawn_blocking(move || FbConnection::open(&owned))
            .await
            .context("firebird connect task failed")??;
        info!(source = %config.describe(), "connected to legacy database");
        Ok(Self::with_executor(conn, config.describe()))
    }
}

impl<E: SqlExecutor> FirebirdSource<E> {
    pub fn with_executor(executor: E, label: impl Into<String>) -> Self {
        Self {
            executor: Arc::new(executor),
            label: label.into(),
        }
    }

    async fn run(&self, statement: SqlStatement) -> Result<Vec<SourceRow>, SourceError> {
        debug!(sql = %statement.sql, params = statement.params.len(), "legacy query");
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || executor.query(&statement.sql, &statement.params))
            .await
            .context("legacy query task failed")?
    }

    /// First column of each row as trimmed text.
    async fn names(&self, statement: SqlStatement) -> Result<Vec<String>, SourceError> {
        Ok(self
            .run(statement)
            .await?
            .iter()
            .filter_map(|row| row.values().first().and_then(SourceValue::as_text))
            .map(|name| name.trim().to_string())
            .collect())
    }
}

#[async_trait]
impl<E: SqlExecutor> LegacySource for FirebirdSource<E> {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        self.names(SqlStatement {
            sql: LIST_TABLES_SQL.to_string(),
            params: Vec::new(),
        })
        .await
    }

    async fn list_columns(&self, table: &str) -> Result<Vec<String>, SourceError> {
        self.names(SqlStatement {
            sql: LIST_COLUMNS_SQL.to_string(),
            params: vec![SourceValue::Text(table.trim().to_ascii_uppercase())],
        })
        .await
    }

    async fn select(&self, query: &RowQuery) -> Result<Vec<SourceRow>, SourceError> {
        self.run(render_select(query)?).await
    }
}
