//! Reads production orders out of the legacy fixed layout, plus whatever routing and lookup
//! columns were discovered for this installation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use opmirror_core::{
    DateField, OrderHeader, OrderId, OrderItem, RoutingStep, StageKey, SyncWindow,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::probe::{ColumnMatcher, ColumnName, SchemaProber};
use crate::routing::{RoutingResolver, RoutingSchema};
use crate::rules::SchemaRules;
use crate::{Filter, LegacySource, RowQuery, SourceError, SourceRow, SourceValue};

pub const ORDERS_TABLE: &str = "ORDEM_PRODUCAO";
pub const ITEMS_TABLE: &str = "ORDEM_PRODUCAO_ITENS";
pub const PRODUCTS_TABLE: &str = "PRODUTOS";
pub const COLORS_TABLE: &str = "CORES";

const HEADER_COLUMNS: [&str; 12] = [
    "ORP_ID",
    "ORP_SERIE",
    "EMP_FIL_CODIGO",
    "ORP_DESCRICAO",
    "ORP_PDV_NUMERO",
    "ORP_DATA",
    "ORP_DT_PREV_INICIO",
    "ORP_DT_VALIDADE",
    "ORP_STS_CODIGO",
    "ORP_QTDE_PRODUCAO",
    "ORP_QTDE_PRODUZIDAS",
    "ORP_QTDE_SALDO",
];

const ITEM_COLUMNS: [&str; 9] = [
    "OPD_ID",
    "OPD_ORP_ID",
    "OPD_ORP_SERIE",
    "OPD_LOTE",
    "OPD_PRO_CODIGO",
    "OPD_COR_CODIGO",
    "OPD_QUANTIDADE",
    "OPD_QTD_PRODUZIDAS",
    "OPD_QTDE_SALDO",
];

pub fn date_column(field: DateField) -> &'static str {
    match field {
        DateField::Issue => "ORP_DATA",
        DateField::PlannedStart => "ORP_DT_PREV_INICIO",
        DateField::Validity => "ORP_DT_VALIDADE",
    }
}

/// Which orders a run picks up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSelection {
    pub filial: i64,
    pub date_field: DateField,
    pub window: SyncWindow,
    /// Legacy status codes; empty means any status.
    pub statuses: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupColumns {
    pub product_description: Option<ColumnName>,
    pub color_name: Option<ColumnName>,
    pub header_color: Option<ColumnName>,
}

/// Source truth for one order, before derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOrder {
    pub header: OrderHeader,
    pub items: Vec<OrderItem>,
    /// `None` when the run has no routing schema.
    pub routing: Option<Vec<RoutingStep>>,
}

pub struct OrderReader {
    source: Arc<dyn LegacySource>,
    lookups: LookupColumns,
    routing: Option<RoutingSchema>,
    routing_warning: Option<String>,
}

fn clean_text(value: &SourceValue) -> Option<String> {
    value
        .as_text()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn invalid(table: &str, column: &str, message: impl Into<String>) -> SourceError {
    SourceError::InvalidValue {
        table: table.to_string(),
        column: column.to_string(),
        message: message.into(),
    }
}

fn required_i64(row: &SourceRow, table: &str, column: &str) -> Result<i64, SourceError> {
    let value = row.get(column);
    value
        .as_i64()
        .ok_or_else(|| invalid(table, column, format!("expected an integer, got `{value}`")))
}

async fn lookup_or_null(
    prober: &mut SchemaProber<'_>,
    table: &str,
    matcher: &ColumnMatcher,
) -> Option<ColumnName> {
    match prober.resolve_in_existing(table, matcher).await {
        Ok(column) => column,
        Err(err) => {
            warn!(table, error = %err, "lookup column discovery failed; reading it as null");
            None
        }
    }
}

impl OrderReader {
    /// Discovers lookup columns and the routing schema once for the run. Neither discovery
    /// fails the run: a lookup whose discovery fails reads as null, and the routing outcome
    /// is kept as a warning.
    pub async fn prepare(
        source: Arc<dyn LegacySource>,
        rules: &SchemaRules,
    ) -> Result<Self, SourceError> {
        let resolver = RoutingResolver::from_rules(&rules.routing)?;
        let product_rule = rules.lookups.product_description.compile()?;
        let color_rule = rules.lookups.color_name.compile()?;
        let header_color_rule = rules.lookups.header_color.compile()?;

        let mut prober = SchemaProber::new(source.as_ref());
        let lookups = LookupColumns {
            product_description: lookup_or_null(&mut prober, PRODUCTS_TABLE, &product_rule).await,
            color_name: lookup_or_null(&mut prober, COLORS_TABLE, &color_rule).await,
            header_color: lookup_or_null(&mut prober, ORDERS_TABLE, &header_color_rule).await,
        };
        debug!(?lookups, "resolved lookup columns");

        let (routing, routing_warning) = match resolver.resolve_with(&mut prober).await {
            Ok(Some(schema)) => (Some(schema), None),
            Ok(None) => {
                let message = "no candidate routing table exposes order-link, stage and sequence columns; routing sync skipped".to_string();
                warn!(source = %source.describe(), "{message}");
                (None, Some(message))
            }
            Err(err) => {
                let message = format!("routing discovery failed: {err}; routing sync skipped");
                warn!(source = %source.describe(), error = %err, "routing discovery failed");
                (None, Some(message))
            }
        };
        drop(prober);

        Ok(Self {
            source,
            lookups,
            routing,
            routing_warning,
        })
    }

    pub fn lookups(&self) -> &LookupColumns {
        &self.lookups
    }

    pub fn routing_schema(&self) -> Option<&RoutingSchema> {
        self.routing.as_ref()
    }

    pub fn routing_warning(&self) -> Option<&str> {
        self.routing_warning.as_deref()
    }

    /// Order ids in the window, newest date first then highest series.
    pub async fn select_order_ids(
        &self,
        selection: &OrderSelection,
    ) -> Result<Vec<OrderId>, SourceError> {
        let date_col = date_column(selection.date_field);
        let statuses = selection
            .statuses
            .iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .map(SourceValue::Text)
            .collect::<Vec<_>>();

        let mut query = RowQuery::from(ORDERS_TABLE)
            .select(["ORP_ID"])
            .eq("EMP_FIL_CODIGO", SourceValue::Int(selection.filial))
            .filter(Filter::Unset {
                column: "ORP_FECHADO".into(),
            });
        if !statuses.is_empty() {
            query = query.filter(Filter::In {
                column: "ORP_STS_CODIGO".into(),
                values: statuses,
            });
        }
        let query = query
            .filter(Filter::BetweenDates {
                column: date_col.into(),
                from: selection.window.from,
                to: selection.window.to,
            })
            .order_desc(date_col)
            .order_desc("ORP_SERIE")
            .first(selection.limit);

        let rows = self.source.select(&query).await?;
        let ids = rows
            .iter()
            .map(|row| required_i64(row, ORDERS_TABLE, "ORP_ID"))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            filial = selection.filial,
            date_field = %selection.date_field,
            window = %selection.window,
            selected = ids.len(),
            "selected source orders"
        );
        Ok(ids)
    }

    pub async fn fetch_header(&self, order_id: OrderId) -> Result<OrderHeader, SourceError> {
        let mut columns = HEADER_COLUMNS.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        if let Some(color) = &self.lookups.header_color {
            columns.push(color.as_str().to_string());
        }
        let query = RowQuery::from(ORDERS_TABLE)
            .select(columns)
            .eq("ORP_ID", SourceValue::Int(order_id))
            .first(Some(1));
        let row = self
            .source
            .select(&query)
            .await?
            .into_iter()
            .next()
            .ok_or(SourceError::OrderNotFound(order_id))?;

        let series = row.get("ORP_SERIE");
        if series.is_null() {
            return Err(invalid(ORDERS_TABLE, "ORP_SERIE", format!("order {order_id} has no series")));
        }
        Ok(OrderHeader {
            id: order_id,
            series: required_i64(&row, ORDERS_TABLE, "ORP_SERIE")?,
            filial: row.get("EMP_FIL_CODIGO").as_i64(),
            description: clean_text(row.get("ORP_DESCRICAO")),
            sales_order: row.get("ORP_PDV_NUMERO").as_i64(),
            status_code: clean_text(row.get("ORP_STS_CODIGO")),
            issued_at: row.get("ORP_DATA").as_timestamp(),
            planned_start_at: row.get("ORP_DT_PREV_INICIO").as_timestamp(),
            valid_until: row.get("ORP_DT_VALIDADE").as_timestamp(),
            planned_qty: row.get("ORP_QTDE_PRODUCAO").as_f64(),
            produced_qty: row.get("ORP_QTDE_PRODUZIDAS").as_f64(),
            remaining_qty: row.get("ORP_QTDE_SALDO").as_f64(),
            color_text: self
                .lookups
                .header_color
                .as_ref()
                .and_then(|c| row.get(c.as_str()).as_text()),
        })
    }

    /// Items linked by order id, or by series when the id link finds nothing.
    pub async fn fetch_items(&self, header: &OrderHeader) -> Result<Vec<OrderItem>, SourceError> {
        let base = RowQuery::from(ITEMS_TABLE)
            .select(ITEM_COLUMNS)
            .order_asc("OPD_ID");
        let mut rows = self
            .source
            .select(&base.clone().eq("OPD_ORP_ID", SourceValue::Int(header.id)))
            .await?;
        if rows.is_empty() {
            rows = self
                .source
                .select(&base.eq("OPD_ORP_SERIE", SourceValue::Int(header.series)))
                .await?;
            if !rows.is_empty() {
                debug!(order_id = header.id, "items linked by series fallback");
            }
        }

        let mut items = rows
            .iter()
            .map(|row| -> Result<OrderItem, SourceError> {
                Ok(OrderItem {
                    id: required_i64(row, ITEMS_TABLE, "OPD_ID")?,
                    order_id: header.id,
                    order_series: row.get("OPD_ORP_SERIE").as_i64().or(Some(header.series)),
                    lot: row.get("OPD_LOTE").as_i64(),
                    product_code: row.get("OPD_PRO_CODIGO").as_i64(),
                    product_description: None,
                    color_code: row.get("OPD_COR_CODIGO").as_i64(),
                    color_name: None,
                    planned_qty: row.get("OPD_QUANTIDADE").as_f64(),
                    produced_qty: row.get("OPD_QTD_PRODUZIDAS").as_f64(),
                    remaining_qty: row.get("OPD_QTDE_SALDO").as_f64(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let descriptions = self
            .lookup_names(
                PRODUCTS_TABLE,
                "PRO_CODIGO",
                self.lookups.product_description.as_ref(),
                items.iter().filter_map(|i| i.product_code),
            )
            .await?;
        let colors = self
            .lookup_names(
                COLORS_TABLE,
                "COR_CODIGO",
                self.lookups.color_name.as_ref(),
                items.iter().filter_map(|i| i.color_code),
            )
            .await?;
        for item in &mut items {
            item.product_description = item
                .product_code
                .and_then(|code| descriptions.get(&code).cloned());
            item.color_name = item.color_code.and_then(|code| colors.get(&code).cloned());
        }
        Ok(items)
    }

    /// `code -> name` for the given codes; empty when the lookup column is unknown.
    async fn lookup_names(
        &self,
        table: &str,
        key_column: &str,
        name_column: Option<&ColumnName>,
        codes: impl Iterator<Item = i64>,
    ) -> Result<BTreeMap<i64, String>, SourceError> {
        let codes = codes.collect::<BTreeSet<_>>();
        let Some(name_column) = name_column else {
            return Ok(BTreeMap::new());
        };
        if codes.is_empty() {
            return Ok(BTreeMap::new());
        }
        let query = RowQuery::from(table)
            .select([key_column, name_column.as_str()])
            .filter(Filter::In {
                column: key_column.to_string(),
                values: codes.into_iter().map(SourceValue::Int).collect(),
            });
        Ok(self
            .source
            .select(&query)
            .await?
            .iter()
            .filter_map(|row| {
                let code = row.get(key_column).as_i64()?;
                let name = clean_text(row.get(name_column.as_str()))?;
                Some((code, name))
            })
            .collect())
    }

    /// Routing steps for the order, deduplicated on their natural key (first row wins).
    pub async fn fetch_routing(
        &self,
        header: &OrderHeader,
    ) -> Result<Option<Vec<RoutingStep>>, SourceError> {
        let Some(schema) = &self.routing else {
            return Ok(None);
        };
        let rows = self
            .source
            .select(&schema.query_for(header.id, header.series))
            .await?;
        let mut seen = BTreeSet::<StageKey>::new();
        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(step) = schema.step_from_row(row, header.series)? {
                if seen.insert(step.key()) {
                    steps.push(step);
                }
            }
        }
        Ok(Some(steps))
    }

    pub async fn fetch_order(&self, order_id: OrderId) -> Result<SourceOrder, SourceError> {
        let header = self.fetch_header(order_id).await?;
        let items = self.fetch_items(&header).await?;
        let routing = self.fetch_routing(&header).await?;
        Ok(SourceOrder {
            header,
            items,
            routing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SnapshotSource, SnapshotTable};
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fixture_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/legacy/sample/snapshot.json")
    }

    fn header_row(
        id: i64,
        series: i64,
        filial: i64,
        status: &str,
        validity: &str,
        closed: i64,
    ) -> Vec<SourceValue> {
        vec![
            SourceValue::Int(id),
            SourceValue::Int(series),
            SourceValue::Int(filial),
            status.into(),
            validity.into(),
            SourceValue::Int(closed),
        ]
    }

    fn small_source() -> Arc<dyn LegacySource> {
        let mut columns = vec![
            "ORP_ID",
            "ORP_SERIE",
            "EMP_FIL_CODIGO",
            "ORP_STS_CODIGO",
            "ORP_DT_VALIDADE",
            "ORP_FECHADO",
        ];
        for extra in HEADER_COLUMNS {
            if !columns.contains(&extra) {
                columns.push(extra);
            }
        }
        let mut orders = SnapshotTable::new(columns);
        for row in [
            header_row(1, 100, 1, "AA", "2025-10-05", 0),
            header_row(2, 200, 1, "IN", "2025-10-07", 0),
            header_row(3, 300, 1, "FF", "2025-10-07", 0),
            header_row(4, 400, 1, "AA", "2025-10-07", 1),
            header_row(5, 500, 2, "AA", "2025-10-07", 0),
            header_row(6, 600, 1, "SS", "2025-12-01", 0),
            header_row(7, 700, 1, "EP", "2025-10-07", 0),
        ] {
            orders = orders.row(row);
        }
        let items = SnapshotTable::new(ITEM_COLUMNS).row(vec![
            SourceValue::Int(11),
            SourceValue::Null,
            SourceValue::Int(200),
            SourceValue::Null,
            SourceValue::Int(50),
            SourceValue::Int(9),
            SourceValue::Float(10.0),
            SourceValue::Float(4.0),
            SourceValue::Float(6.0),
        ]);
        let products = SnapshotTable::new(["PRO_CODIGO", "PRO_DESCRICAO"])
            .row(vec![SourceValue::Int(50), "Perfil U".into()]);
        let colors = SnapshotTable::new(["COR_CODIGO", "COR_NOME"])
            .row(vec![SourceValue::Int(9), " Azul ".into()]);
        Arc::new(
            SnapshotSource::builder()
                .table(ORDERS_TABLE, orders)
                .table(ITEMS_TABLE, items)
                .table(PRODUCTS_TABLE, products)
                .table(COLORS_TABLE, colors)
                .build(),
        )
    }

    fn selection(statuses: &[&str]) -> OrderSelection {
        OrderSelection {
            filial: 1,
            date_field: DateField::Validity,
            window: SyncWindow::explicit(day(2025, 10, 1), day(2025, 10, 31)).unwrap(),
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            limit: None,
        }
    }

    #[tokio::test]
    async fn selection_applies_filial_closed_status_and_window() {
        let reader = OrderReader::prepare(small_source(), &SchemaRules::builtin().unwrap())
            .await
            .unwrap();
        let ids = reader
            .select_order_ids(&selection(&["AA", "in", "EP", "SS"]))
            .await
            .unwrap();
        // 7 and 2 share the date; 7 has the higher series.
        assert_eq!(ids, vec![7, 2, 1]);

        let all = reader.select_order_ids(&selection(&[])).await.unwrap();
        assert_eq!(all, vec![7, 3, 2, 1]);
    }

    #[tokio::test]
    async fn missing_routing_tables_degrade_to_a_warning() {
        let reader = OrderReader::prepare(small_source(), &SchemaRules::builtin().unwrap())
            .await
            .unwrap();
        assert!(reader.routing_schema().is_none());
        assert!(reader.routing_warning().unwrap().contains("routing sync skipped"));
        let order = reader.fetch_order(2).await.unwrap();
        assert!(order.routing.is_none());
    }

    #[tokio::test]
    async fn items_fall_back_to_the_series_link_and_carry_lookups() {
        let reader = OrderReader::prepare(small_source(), &SchemaRules::builtin().unwrap())
            .await
            .unwrap();
        assert_eq!(
            reader.lookups().product_description.as_ref().map(ColumnName::as_str),
            Some("PRO_DESCRICAO")
        );
        let order = reader.fetch_order(2).await.unwrap();
        assert_eq!(order.items.len(), 1);
        let item = &order.items[0];
        assert_eq!(item.order_id, 2);
        assert_eq!(item.product_description.as_deref(), Some("Perfil U"));
        assert_eq!(item.color_name.as_deref(), Some("Azul"));
        assert!(order.header.color_text.is_none());
    }

    /// Delegates to an inner source but cannot list the columns of one table.
    struct UnlistableTable {
        inner: Arc<dyn LegacySource>,
        table: &'static str,
    }

    #[async_trait::async_trait]
    impl LegacySource for UnlistableTable {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
            self.inner.list_tables().await
        }

        async fn list_columns(&self, table: &str) -> Result<Vec<String>, SourceError> {
            if table.eq_ignore_ascii_case(self.table) {
                return Err(anyhow::anyhow!("no permission for read access to table {table}").into());
            }
            self.inner.list_columns(table).await
        }

        async fn select(&self, query: &RowQuery) -> Result<Vec<SourceRow>, SourceError> {
            self.inner.select(query).await
        }
    }

    #[tokio::test]
    async fn lookup_discovery_failure_reads_as_null() {
        let source = Arc::new(UnlistableTable {
            inner: small_source(),
            table: PRODUCTS_TABLE,
        });
        let reader = OrderReader::prepare(source, &SchemaRules::builtin().unwrap())
            .await
            .unwrap();
        assert!(reader.lookups().product_description.is_none());
        assert_eq!(
            reader.lookups().color_name.as_ref().map(ColumnName::as_str),
            Some("COR_NOME")
        );

        let order = reader.fetch_order(2).await.unwrap();
        assert_eq!(order.items.len(), 1);
        assert!(order.items[0].product_description.is_none());
        assert_eq!(order.items[0].color_name.as_deref(), Some("Azul"));
    }

    #[tokio::test]
    async fn unknown_order_is_a_not_found_signal() {
        let reader = OrderReader::prepare(small_source(), &SchemaRules::builtin().unwrap())
            .await
            .unwrap();
        let err = reader.fetch_header(999).await.unwrap_err();
        assert!(matches!(err, SourceError::OrderNotFound(999)));
    }

    #[tokio::test]
    async fn sample_fixture_resolves_routing_and_reads_orders() {
        let source: Arc<dyn LegacySource> = Arc::new(SnapshotSource::load(&fixture_path()).unwrap());
        let reader = OrderReader::prepare(source, &SchemaRules::builtin().unwrap())
            .await
            .unwrap();
        let schema = reader.routing_schema().unwrap();
        assert_eq!(schema.table, "PCP_ORP_ROTEIRO");
        assert_eq!(
            reader.lookups().header_color.as_ref().map(ColumnName::as_str),
            Some("ORP_COR_TXT")
        );

        let selection = OrderSelection {
            filial: 1,
            date_field: DateField::Validity,
            window: SyncWindow::explicit(day(2025, 10, 1), day(2025, 11, 30)).unwrap(),
            statuses: vec!["AA".into(), "IN".into(), "EP".into(), "SS".into()],
            limit: None,
        };
        let ids = reader.select_order_ids(&selection).await.unwrap();
        assert!(!ids.is_empty());
        for id in ids {
            let order = reader.fetch_order(id).await.unwrap();
            assert_eq!(order.header.id, id);
            assert!(order.routing.is_some());
        }
    }
}
