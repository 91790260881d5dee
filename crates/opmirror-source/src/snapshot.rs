//! File-backed legacy source: a JSON export of the catalog plus table rows.
//!
//! Export shape:
//!
//! ```json
//! { "label": "plant-a", "tables": { "ORDEM_PRODUCAO": { "kind": "table", "columns": ["ORP_ID"], "rows": [{"ORP_ID": 1}] } } }
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{LegacySource, RowQuery, SourceError, SourceRow, SourceValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    #[default]
    Table,
    View,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTable {
    kind: TableKind,
    columns: Vec<String>,
    rows: Vec<Vec<SourceValue>>,
}

impl SnapshotTable {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            kind: TableKind::Table,
            columns: columns
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_uppercase())
                .collect(),
            rows: Vec::new(),
        }
    }

    pub fn view<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            kind: TableKind::View,
            ..Self::new(columns)
        }
    }

    /// Values are positional; short rows are padded with NULL.
    pub fn row(mut self, mut values: Vec<SourceValue>) -> Self {
        values.resize(self.columns.len(), SourceValue::Null);
        self.rows.push(values);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    label: Option<String>,
    tables: BTreeMap<String, TableFile>,
}

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default)]
    kind: TableKind,
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<BTreeMap<String, JsonValue>>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotSource {
    label: String,
    tables: BTreeMap<String, SnapshotTable>,
}

#[derive(Debug, Default)]
pub struct SnapshotSourceBuilder {
    label: Option<String>,
    tables: BTreeMap<String, SnapshotTable>,
}

impl SnapshotSourceBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn table(mut self, name: &str, table: SnapshotTable) -> Self {
        self.tables.insert(name.trim().to_ascii_uppercase(), table);
        self
    }

    pub fn build(self) -> SnapshotSource {
        SnapshotSource {
            label: self.label.unwrap_or_else(|| "in-memory".to_string()),
            tables: self.tables,
        }
    }
}

impl SnapshotSource {
    pub fn builder() -> SnapshotSourceBuilder {
        SnapshotSourceBuilder::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading legacy snapshot {}", path.display()))?;
        let file: SnapshotFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing legacy snapshot {}", path.display()))?;

        let mut builder = Self::builder()
            .label(file.label.unwrap_or_else(|| path.display().to_string()));
        for (name, table_file) in file.tables {
            let mut table = SnapshotTable::new(&table_file.columns);
            table.kind = table_file.kind;
            for (idx, row) in table_file.rows.into_iter().enumerate() {
                let mut row: BTreeMap<String, JsonValue> = row
                    .into_iter()
                    .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
                    .collect();
                if let Some(extra) = row.keys().find(|k| !table.has_column(k)) {
                    anyhow::bail!(
                        "snapshot {}: row {idx} of {name} has undeclared column {extra}",
                        path.display()
                    );
                }
                let values = table
                    .columns
                    .iter()
                    .map(|c| row.remove(c).map(SourceValue::from).unwrap_or(SourceValue::Null))
                    .collect();
                table = table.row(values);
            }
            builder = builder.table(&name, table);
        }
        Ok(builder.build())
    }

    pub fn table(&self, name: &str) -> Option<&SnapshotTable> {
        self.tables.get(&name.trim().to_ascii_uppercase())
    }

    fn require_table(&self, name: &str) -> Result<&SnapshotTable, SourceError> {
        self.table(name)
            .ok_or_else(|| SourceError::UnknownTable(name.to_string()))
    }
}

fn compare_rows(a: &SourceRow, b: &SourceRow, query: &RowQuery) -> Ordering {
    for key in &query.order_by {
        let (left, right) = (a.get(&key.column), b.get(&key.column));
        // NULLs sort last in both directions.
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {
                let ord = left.compare(right).unwrap_or(Ordering::Equal);
                if key.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl LegacySource for SnapshotSource {
    fn describe(&self) -> String {
        format!("snapshot:{}", self.label)
    }

    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        Ok(self
            .tables
            .iter()
            .filter(|(name, table)| table.kind == TableKind::Table && !name.starts_with("RDB$"))
            .map(|(name, _)| name.clone())
            .collect())
    }

    // Mirrors a catalog query: an unknown table simply has no columns.
    async fn list_columns(&self, table: &str) -> Result<Vec<String>, SourceError> {
        Ok(self
            .table(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn select(&self, query: &RowQuery) -> Result<Vec<SourceRow>, SourceError> {
        let table = self.require_table(&query.table)?;
        if let Some(missing) = query.referenced_columns().find(|c| !table.has_column(c)) {
            return Err(SourceError::UnknownColumn {
                table: query.table.clone(),
                column: missing.to_string(),
            });
        }

        let mut rows = table
            .rows
            .iter()
            .map(|values| SourceRow::new(table.columns.clone(), values.clone()))
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| compare_rows(a, b, query));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        if query.columns.is_empty() {
            return Ok(rows);
        }
        let projection = query
            .columns
            .iter()
            .map(|c| c.to_ascii_uppercase())
            .collect::<Vec<_>>();
        Ok(rows
            .into_iter()
            .map(|row| {
                let values = projection.iter().map(|c| row.get(c).clone()).collect();
                SourceRow::new(projection.clone(), values)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Filter;

    fn source() -> SnapshotSource {
        SnapshotSource::builder()
            .table(
                "orders",
                SnapshotTable::new(["ID", "SERIE", "DT"])
                    .row(vec![SourceValue::Int(1), SourceValue::Int(10), "2025-01-03".into()])
                    .row(vec![SourceValue::Int(2), SourceValue::Int(20), SourceValue::Null])
                    .row(vec![SourceValue::Int(3), SourceValue::Int(30), "2025-01-05".into()])
                    .row(vec![SourceValue::Int(4), SourceValue::Int(25), "2025-01-05".into()]),
            )
            .table("V_ORDERS", SnapshotTable::view(["ID"]))
            .build()
    }

    #[tokio::test]
    async fn catalog_lists_tables_but_not_views() {
        let source = source();
        assert_eq!(source.list_tables().await.unwrap(), vec!["ORDERS".to_string()]);
        assert!(source.has_table("orders").await.unwrap());
        assert!(!source.has_table("V_ORDERS").await.unwrap());
        assert!(source.list_columns("MISSING").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ordering_puts_nulls_last_and_honours_limit() {
        let query = RowQuery::from("ORDERS")
            .select(["ID"])
            .order_desc("DT")
            .order_desc("SERIE")
            .first(Some(3));
        let ids = source()
            .select(&query)
            .await
            .unwrap()
            .iter()
            .map(|r| r.get("ID").as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 4, 1]);
    }

    #[tokio::test]
    async fn unknown_columns_are_rejected() {
        let query = RowQuery::from("ORDERS").filter(Filter::Unset {
            column: "CLOSED".into(),
        });
        let err = source().select(&query).await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownColumn { .. }));
        let err = source().select(&RowQuery::from("NOPE")).await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownTable(_)));
    }

    #[test]
    fn loads_exports_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{"tables":{"cores":{"columns":["cor_codigo","cor_nome"],"rows":[{"COR_CODIGO":1,"cor_nome":"Azul"}]}}}"#,
        )
        .unwrap();
        let source = SnapshotSource::load(&path).unwrap();
        let table = source.table("CORES").unwrap();
        assert_eq!(table.columns(), ["COR_CODIGO", "COR_NOME"]);
        assert_eq!(table.len(), 1);

        std::fs::write(&path, r#"{"tables":{"T":{"columns":["A"],"rows":[{"B":1}]}}}"#).unwrap();
        assert!(SnapshotSource::load(&path).is_err());
    }
}
