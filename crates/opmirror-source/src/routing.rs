//! Routing-Table Resolver.

use opmirror_core::{OrderId, OrderSeries, RoutingStep};
use serde::Serialize;
use tracing::{debug, info};

use crate::probe::{ColumnMatcher, ColumnName, SchemaProber};
use crate::rules::RoutingRules;
use crate::{LegacySource, RowQuery, SourceError, SourceRow, SourceValue};

/// Which order key the link column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Id,
    Series,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderLink {
    pub column: ColumnName,
    pub kind: LinkKind,
}

impl OrderLink {
    /// Heuristic: a name mentioning "ID" links on the primary id, anything else on series.
    pub fn infer(column: ColumnName) -> Self {
        let kind = if column.mentions("ID") {
            LinkKind::Id
        } else {
            LinkKind::Series
        };
        Self { column, kind }
    }

    pub fn value_for(&self, id: OrderId, series: OrderSeries) -> i64 {
        match self.kind {
            LinkKind::Id => id,
            LinkKind::Series => series,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingSchema {
    pub table: String,
    pub order_link: OrderLink,
    pub stage: ColumnName,
    pub sequence: ColumnName,
    pub started_at: Option<ColumnName>,
    pub finished_at: Option<ColumnName>,
    pub status: Option<ColumnName>,
}

impl RoutingSchema {
    pub fn optional_columns(&self) -> impl Iterator<Item = &ColumnName> {
        [&self.started_at, &self.finished_at, &self.status]
            .into_iter()
            .flatten()
    }

    pub fn query_for(&self, id: OrderId, series: OrderSeries) -> RowQuery {
        let columns = [&self.order_link.column, &self.stage, &self.sequence]
            .into_iter()
            .chain(self.optional_columns())
            .map(|c| c.as_str().to_string())
            .collect::<Vec<_>>();
        RowQuery::from(self.table.clone())
            .select(columns)
            .eq(
                self.order_link.column.as_str(),
                SourceValue::Int(self.order_link.value_for(id, series)),
            )
            .order_asc(self.sequence.as_str())
            .order_asc(self.stage.as_str())
    }

    /// Rows without a stage or sequence have no key and are skipped.
    pub fn step_from_row(
        &self,
        row: &SourceRow,
        order_series: OrderSeries,
    ) -> Result<Option<RoutingStep>, SourceError> {
        let (Some(stage_id), Some(sequence)) = (
            self.integer(row, &self.stage)?,
            self.integer(row, &self.sequence)?,
        ) else {
            debug!(table = %self.table, order_series, "skipping routing row without stage/sequence");
            return Ok(None);
        };
        let timestamp = |column: &Option<ColumnName>| {
            column
                .as_ref()
                .and_then(|c| row.get(c.as_str()).as_timestamp())
        };
        let status_code = self
            .status
            .as_ref()
            .and_then(|c| row.get(c.as_str()).as_text())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(Some(RoutingStep {
            order_series,
            stage_id,
            sequence,
            started_at: timestamp(&self.started_at),
            finished_at: timestamp(&self.finished_at),
            status_code,
        }))
    }

    fn integer(&self, row: &SourceRow, column: &ColumnName) -> Result<Option<i64>, SourceError> {
        let value = row.get(column.as_str());
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_i64()
            .map(Some)
            .ok_or_else(|| SourceError::InvalidValue {
                table: self.table.clone(),
                column: column.to_string(),
                message: format!("expected an integer, got `{value}`"),
            })
    }
}

pub struct RoutingResolver {
    tables: Vec<String>,
    order_link: ColumnMatcher,
    stage: ColumnMatcher,
    sequence: ColumnMatcher,
    started_at: ColumnMatcher,
    finished_at: ColumnMatcher,
    status: ColumnMatcher,
}

impl RoutingResolver {
    pub fn from_rules(rules: &RoutingRules) -> Result<Self, SourceError> {
        let columns = &rules.columns;
        Ok(Self {
            tables: rules.tables.clone(),
            order_link: columns.order_link.compile()?,
            stage: columns.stage.compile()?,
            sequence: columns.sequence.compile()?,
            started_at: columns.started_at.compile()?,
            finished_at: columns.finished_at.compile()?,
            status: columns.status.compile()?,
        })
    }

    pub async fn resolve(
        &self,
        source: &dyn LegacySource,
    ) -> Result<Option<RoutingSchema>, SourceError> {
        self.resolve_with(&mut SchemaProber::new(source)).await
    }

    /// First candidate table that exists and yields all three mandatory columns.
    pub async fn resolve_with(
        &self,
        prober: &mut SchemaProber<'_>,
    ) -> Result<Option<RoutingSchema>, SourceError> {
        for table in &self.tables {
            if !prober.table_exists(table).await? {
                continue;
            }
            let order_link = prober.resolve_column(table, &self.order_link).await?;
            let stage = prober.resolve_column(table, &self.stage).await?;
            let sequence = prober.resolve_column(table, &self.sequence).await?;
            let (Some(order_link), Some(stage), Some(sequence)) = (order_link, stage, sequence)
            else {
                debug!(%table, "routing candidate lacks a mandatory column");
                continue;
            };
            let schema = RoutingSchema {
                table: table.trim().to_ascii_uppercase(),
                order_link: OrderLink::infer(order_link),
                stage,
                sequence,
                started_at: prober.resolve_column(table, &self.started_at).await?,
                finished_at: prober.resolve_column(table, &self.finished_at).await?,
                status: prober.resolve_column(table, &self.status).await?,
            };
            info!(
                table = %schema.table,
                order_link = %schema.order_link.column,
                stage = %schema.stage,
                sequence = %schema.sequence,
                "resolved routing schema"
            );
            return Ok(Some(schema));
        }
        Ok(None)
    }
}
