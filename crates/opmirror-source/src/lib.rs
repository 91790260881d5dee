//! Legacy source contracts + schema discovery over runtime catalogs.

pub mod firebird;
pub mod orders;
pub mod probe;
pub mod routing;
pub mod rules;
pub mod snapshot;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use opmirror_core::OrderId;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use firebird::{FbConnection, FirebirdConfig, FirebirdSource, SqlExecutor, SqlStatement};
pub use orders::{
    date_column, LookupColumns, OrderReader, OrderSelection, SourceOrder, COLORS_TABLE,
    ITEMS_TABLE, ORDERS_TABLE, PRODUCTS_TABLE,
};
pub use probe::{pick_column, ColumnMatcher, ColumnName, ColumnRule, SchemaProber};
pub use routing::{LinkKind, OrderLink, RoutingResolver, RoutingSchema};
pub use rules::SchemaRules;
pub use snapshot::{SnapshotSource, SnapshotTable, TableKind};

pub const CRATE_NAME: &str = "opmirror-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("table {0} does not exist in the source")]
    UnknownTable(String),
    #[error("column {column} does not exist in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("order {0} not found in the source")]
    OrderNotFound(OrderId),
    #[error("invalid value in {table}.{column}: {message}")]
    InvalidValue {
        table: String,
        column: String,
        message: String,
    },
    #[error("invalid column pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A single cell as read from the legacy database.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SourceValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

static NULL_VALUE: SourceValue = SourceValue::Null;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

impl SourceValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Self::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(t) => Some(t.clone()),
            Self::Date(d) => Some(d.to_string()),
            Self::Timestamp(ts) => Some(ts.to_string()),
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            Self::Text(t) => parse_timestamp(t),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        self.as_timestamp().map(|ts| ts.date())
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    fn is_temporal(&self) -> bool {
        matches!(self, Self::Date(_) | Self::Timestamp(_))
    }

    /// SQL-flavoured comparison: numbers and dates compare by value, text ignores trailing
    /// blanks like fixed-width CHAR columns, and NULL compares to nothing.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Text(a), Self::Text(b)) => Some(a.trim_end().cmp(b.trim_end())),
            (a, b) if a.is_numeric() || b.is_numeric() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (a, b) if a.is_temporal() || b.is_temporal() => {
                Some(a.as_timestamp()?.cmp(&b.as_timestamp()?))
            }
            _ => None,
        }
    }

    pub fn sql_eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for SourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<JsonValue> for SourceValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Int(i64::from(b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => {
                if let Some(ts) = TIMESTAMP_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).ok())
                {
                    Self::Timestamp(ts)
                } else if let Some(d) = parse_date(&s) {
                    Self::Date(d)
                } else {
                    Self::Text(s)
                }
            }
            other => Self::Text(other.to_string()),
        }
    }
}

impl From<i64> for SourceValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SourceValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SourceValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SourceValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for SourceValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for SourceValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<SourceValue>> From<Option<T>> for SourceValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One result row; column names are upper-cased and looked up case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRow {
    columns: Vec<String>,
    values: Vec<SourceValue>,
}

impl SourceRow {
    pub fn new(columns: Vec<String>, values: Vec<SourceValue>) -> Self {
        Self {
            columns: columns.into_iter().map(|c| c.to_ascii_uppercase()).collect(),
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SourceValue] {
        &self.values
    }

    pub fn get(&self, column: &str) -> &SourceValue {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
            .unwrap_or(&NULL_VALUE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq {
        column: String,
        value: SourceValue,
    },
    In {
        column: String,
        values: Vec<SourceValue>,
    },
    /// Inclusive on whole days; timestamps are compared by their date part.
    BetweenDates {
        column: String,
        from: NaiveDate,
        to: NaiveDate,
    },
    /// `COALESCE(column, 0) = 0`
    Unset { column: String },
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. }
            | Self::In { column, .. }
            | Self::BetweenDates { column, .. }
            | Self::Unset { column } => column,
        }
    }

    pub fn matches(&self, row: &SourceRow) -> bool {
        let value = row.get(self.column());
        match self {
            Self::Eq { value: expected, .. } => value.sql_eq(expected),
            Self::In { values, .. } => values.iter().any(|candidate| value.sql_eq(candidate)),
            Self::BetweenDates { from, to, .. } => value
                .as_date()
                .map(|d| *from <= d && d <= *to)
                .unwrap_or(false),
            Self::Unset { .. } => value.is_null() || value.as_f64() == Some(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub column: String,
    pub descending: bool,
}

/// Parameterized single-table SELECT: projection, conjunctive filters, ordering with NULLs
/// last, and an optional `FIRST n` limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<SourceValue>) -> Self {
        self.filter(Filter::Eq {
            column: column.into(),
            value: value.into(),
        })
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderKey {
            column: column.into(),
            descending: false,
        });
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(OrderKey {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn first(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Every column the query references, for validation against the catalog.
    pub fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(String::as_str)
            .chain(self.filters.iter().map(Filter::column))
            .chain(self.order_by.iter().map(|k| k.column.as_str()))
    }
}

/// The legacy database as seen through its metadata catalog and plain SELECTs.
#[async_trait]
pub trait LegacySource: Send + Sync {
    fn describe(&self) -> String;

    /// Non-system, non-view tables.
    async fn list_tables(&self) -> Result<Vec<String>, SourceError>;

    /// Columns of `table` in ordinal order.
    async fn list_columns(&self, table: &str) -> Result<Vec<String>, SourceError>;

    async fn select(&self, query: &RowQuery) -> Result<Vec<SourceRow>, SourceError>;

    async fn has_table(&self, table: &str) -> Result<bool, SourceError> {
        Ok(self
            .list_tables()
            .await?
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(table.trim())))
    }
}
