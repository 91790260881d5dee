//! Schema Prober: maps a role ("stage column", "color name column", ...) to whatever the
//! installation actually called it.

use std::collections::HashMap;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::{LegacySource, SourceError};

/// Ordered candidates for one column role: exact names first, then regex patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRule {
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl ColumnRule {
    pub fn compile(&self) -> Result<ColumnMatcher, SourceError> {
        let patterns = self
            .patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| SourceError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ColumnMatcher {
            preferred: self.preferred.iter().map(|p| p.trim().to_string()).collect(),
            patterns,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMatcher {
    preferred: Vec<String>,
    patterns: Vec<Regex>,
}

/// A column name confirmed to exist in the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ColumnName(String);

impl ColumnName {
    /// For names already known to exist, e.g. ones listed by the catalog.
    pub fn from_catalog(name: &str) -> Self {
        Self(name.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substring test on the upper-cased name.
    pub fn mentions(&self, fragment: &str) -> bool {
        self.0
            .to_ascii_uppercase()
            .contains(&fragment.to_ascii_uppercase())
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Preferred names win in their listed order; otherwise the first pattern with any hit wins,
/// returning its first hit in catalog order.
pub fn pick_column(columns: &[String], matcher: &ColumnMatcher) -> Option<ColumnName> {
    let real = columns.iter().map(|c| c.trim()).collect::<Vec<_>>();
    matcher
        .preferred
        .iter()
        .find_map(|wanted| real.iter().find(|c| c.eq_ignore_ascii_case(wanted)))
        .or_else(|| {
            matcher
                .patterns
                .iter()
                .find_map(|pattern| real.iter().find(|c| pattern.is_match(c)))
        })
        .map(|c| ColumnName::from_catalog(c))
}

/// Catalog reader with a per-run cache, so each table is listed once.
pub struct SchemaProber<'a> {
    source: &'a dyn LegacySource,
    tables: Option<Vec<String>>,
    columns: HashMap<String, Vec<String>>,
}

impl<'a> SchemaProber<'a> {
    pub fn new(source: &'a dyn LegacySource) -> Self {
        Self {
            source,
            tables: None,
            columns: HashMap::new(),
        }
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool, SourceError> {
        if self.tables.is_none() {
            self.tables = Some(self.source.list_tables().await?);
        }
        Ok(self
            .tables
            .iter()
            .flatten()
            .any(|t| t.trim().eq_ignore_ascii_case(table.trim())))
    }

    pub async fn columns(&mut self, table: &str) -> Result<&[String], SourceError> {
        let key = table.trim().to_ascii_uppercase();
        if !self.columns.contains_key(&key) {
            let listed = self.source.list_columns(&key).await?;
            self.columns.insert(key.clone(), listed);
        }
        Ok(self.columns.get(&key).map(Vec::as_slice).unwrap_or_default())
    }

    pub async fn resolve_column(
        &mut self,
        table: &str,
        matcher: &ColumnMatcher,
    ) -> Result<Option<ColumnName>, SourceError> {
        let columns = self.columns(table).await?;
        Ok(pick_column(columns, matcher))
    }

    /// Same as `resolve_column`, but a missing table resolves to nothing.
    pub async fn resolve_in_existing(
        &mut self,
        table: &str,
        matcher: &ColumnMatcher,
    ) -> Result<Option<ColumnName>, SourceError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        self.resolve_column(table, matcher).await
    }
}
