//! Read-only JSON query API over the order mirror.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, NaiveDate, NaiveDateTime};
use opmirror_core::{
    paint_totals, resolve_order_color, DateField, MirrorOrder, OrderId, PaintBalance, PaintCatalog,
    QuantityTotals, StageStatus, SyncWindow,
};
use opmirror_storage::{load_paint_catalog_or_empty, MirrorReader, OrderScope, PgMirror};
use opmirror_sync::{reports, SyncConfig, SyncRunSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "opmirror-web";
pub const STAGE_NAMES_FILE: &str = "stages.yaml";

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<dyn MirrorReader>,
    pub paint: PaintCatalog,
    pub stage_names: BTreeMap<i64, String>,
    pub reports_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(reader: Arc<dyn MirrorReader>) -> Self {
        Self {
            reader,
            paint: PaintCatalog::default(),
            stage_names: BTreeMap::new(),
            reports_dir: None,
        }
    }

    pub fn with_paint(mut self, paint: PaintCatalog) -> Self {
        self.paint = paint;
        self
    }

    pub fn with_stage_names(mut self, stage_names: BTreeMap<i64, String>) -> Self {
        self.stage_names = stage_names;
        self
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }

    /// Color as shown everywhere in the API, always recomputed from the stored inputs.
    fn color_of(&self, order: &MirrorOrder) -> String {
        resolve_order_color(order.header.color_text.as_deref(), &order.items, &self.paint)
    }
}

#[derive(Debug, Deserialize)]
struct StagesYaml {
    #[serde(default)]
    stages: BTreeMap<i64, String>,
}

pub fn load_stage_names(path: &Path) -> anyhow::Result<BTreeMap<i64, String>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: StagesYaml =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.stages)
}

#[derive(Debug, Deserialize, Default)]
struct OrdersQuery {
    filial: Option<i64>,
    date_field: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    days_back: Option<i64>,
    days_ahead: Option<i64>,
    /// Comma-separated status names, e.g. `OPEN,STARTED`.
    status: Option<String>,
    q: Option<String>,
    color_contains: Option<String>,
    percent_min: Option<f64>,
    percent_max: Option<f64>,
    sort: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
    /// Paint queue only.
    limit: Option<usize>,
}

impl OrdersQuery {
    fn scope(&self, today: NaiveDate) -> Result<OrderScope, String> {
        let date_field = match &self.date_field {
            Some(raw) => raw.parse::<DateField>().map_err(|e| e.to_string())?,
            None => DateField::default(),
        };
        let window = match (self.from, self.to, self.days_back, self.days_ahead) {
            (Some(from), Some(to), _, _) => {
                Some(SyncWindow::explicit(from, to).map_err(|e| e.to_string())?)
            }
            (Some(_), None, _, _) | (None, Some(_), _, _) => {
                return Err("`from` and `to` must be given together".to_string())
            }
            (None, None, None, None) => None,
            (None, None, back, ahead) => Some(
                SyncWindow::relative(today, back.unwrap_or(0), ahead.unwrap_or(0))
                    .map_err(|e| e.to_string())?,
            ),
        };
        let status_names = self
            .status
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        Ok(OrderScope {
            filial: self.filial,
            date_field,
            window,
            status_names,
        })
    }

    fn admits(&self, row: &OrderSummary) -> bool {
        if let Some(q) = self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            let needle = q.to_lowercase();
            let hit = row
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle))
                || row.order_id.to_string() == q
                || row.series.to_string() == q
                || row.sales_order.is_some_and(|n| n.to_string() == q);
            if !hit {
                return false;
            }
        }
        if let Some(color) = self.color_contains.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            if !row
                .resolved_color
                .to_lowercase()
                .contains(&color.to_lowercase())
            {
                return false;
            }
        }
        self.percent_min.map_or(true, |min| row.completion_percent >= min)
            && self.percent_max.map_or(true, |max| row.completion_percent <= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub series: i64,
    pub filial: Option<i64>,
    pub description: Option<String>,
    pub sales_order: Option<i64>,
    pub status_code: Option<String>,
    pub status_name: String,
    pub issued_at: Option<NaiveDateTime>,
    pub planned_start_at: Option<NaiveDateTime>,
    pub valid_until: Option<NaiveDateTime>,
    pub completion_percent: f64,
    pub resolved_color: String,
    pub item_count: usize,
}

impl OrderSummary {
    fn from_order(state: &AppState, order: &MirrorOrder) -> Self {
        let header = &order.header;
        Self {
            order_id: header.id,
            series: header.series,
            filial: header.filial,
            description: header.description.clone(),
            sales_order: header.sales_order,
            status_code: header.status_code.clone(),
            status_name: order.status_name.clone(),
            issued_at: header.issued_at,
            planned_start_at: header.planned_start_at,
            valid_until: header.valid_until,
            completion_percent: order.completion_percent,
            resolved_color: state.color_of(order),
            item_count: order.items.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPage {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
    pub orders: Vec<OrderSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemSummary {
    pub count: usize,
    pub planned_qty: f64,
    pub produced_qty: f64,
    pub remaining_qty: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemView {
    pub item_id: i64,
    pub lot: Option<i64>,
    pub product_code: Option<i64>,
    pub product_description: Option<String>,
    pub color_code: Option<i64>,
    pub color_name: Option<String>,
    pub planned_qty: Option<f64>,
    pub produced_qty: Option<f64>,
    pub remaining_qty: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingView {
    pub stage_id: i64,
    pub stage_name: Option<String>,
    pub sequence: i64,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub status_code: Option<String>,
    pub status: Option<StageStatus>,
}

/// Square meters of paint items. Paint items are measured in m2 in the legacy system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PaintSummary {
    pub planned_m2: f64,
    pub produced_m2: f64,
    pub remaining_m2: f64,
}

impl From<QuantityTotals> for PaintSummary {
    fn from(totals: QuantityTotals) -> Self {
        Self {
            planned_m2: totals.planned,
            produced_m2: totals.produced,
            remaining_m2: totals.remaining,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetail {
    pub order: OrderSummary,
    pub item_summary: ItemSummary,
    pub paint: PaintSummary,
    pub items: Vec<ItemView>,
    /// `None` when routing was never mirrored for this order.
    pub routing: Option<Vec<RoutingView>>,
}

/// Orders where only painting is left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaintQueue {
    pub count: usize,
    pub orders: Vec<PaintQueueRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaintQueueRow {
    pub order: OrderSummary,
    pub paint: PaintSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dashboard {
    pub total_orders: usize,
    pub average_completion: f64,
    pub by_status: BTreeMap<String, usize>,
    pub by_color: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub finished_at: String,
    pub dry_run: bool,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub has_parquet_manifest: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/orders", get(orders_handler))
        .route("/orders/{id}", get(order_detail_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/paint/queue", get(paint_queue_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let mirror = PgMirror::connect(&config.database_url)
        .await
        .context("connecting to the mirror database")?;

    let (paint, paint_label) =
        load_paint_catalog_or_empty(config.paint_rules.as_deref(), &mirror).await;
    info!(paint = %paint_label, "paint catalog loaded");
    let stages_path = config.rules_dir.join(STAGE_NAMES_FILE);
    let stage_names = load_stage_names(&stages_path).unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "stage names unavailable");
        BTreeMap::new()
    });

    let state = AppState::new(Arc::new(mirror))
        .with_paint(paint)
        .with_stage_names(stage_names)
        .with_reports_dir(&config.reports_dir);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "query API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn orders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> Response {
    let rows = match filtered_orders(&state, &query).await {
        Ok(rows) => rows,
        Err(resp) => return resp,
    };
    Json(paginate(rows, &query)).into_response()
}

async fn order_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<OrderId>,
) -> Response {
    match state.reader.load_order(id).await {
        Ok(Some(order)) => Json(order_detail(&state, &order)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("order {id} not found") })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> Response {
    match filtered_orders(&state, &query).await {
        Ok(rows) => Json(dashboard(&rows)).into_response(),
        Err(resp) => resp,
    }
}

async fn paint_queue_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> Response {
    let (scope, orders) = match scoped_orders(&state, &query).await {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let mut queued = orders
        .iter()
        .filter_map(|order| {
            let balance = PaintBalance::of(&order.items, &state.paint);
            if !balance.awaiting_paint_only() {
                return None;
            }
            let row = PaintQueueRow {
                order: OrderSummary::from_order(&state, order),
                paint: balance.paint.into(),
            };
            query
                .admits(&row.order)
                .then(|| (order.header.date(scope.date_field), row))
        })
        .collect::<Vec<_>>();
    // Closest date first, undated last, then newest series.
    queued.sort_by(|(a_date, a), (b_date, b)| match (a_date, b_date) {
        (Some(x), Some(y)) => x.cmp(y).then(b.order.series.cmp(&a.order.series)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.order.series.cmp(&a.order.series),
    });
    let orders = queued
        .into_iter()
        .take(query.limit.unwrap_or(200).clamp(1, 1000))
        .map(|(_, row)| row)
        .collect::<Vec<_>>();
    Json(PaintQueue {
        count: orders.len(),
        orders,
    })
    .into_response()
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let Some(dir) = &state.reports_dir else {
        return Json(Vec::<RunReportRow>::new()).into_response();
    };
    match load_runs(dir, query.limit.unwrap_or(20).clamp(1, 200)) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

async fn scoped_orders(
    state: &AppState,
    query: &OrdersQuery,
) -> Result<(OrderScope, Vec<MirrorOrder>), Response> {
    let scope = query
        .scope(Local::now().date_naive())
        .map_err(bad_request)?;
    let orders = state
        .reader
        .list_orders(&scope)
        .await
        .map_err(|err| server_error(err.into()))?;
    Ok((scope, orders))
}

async fn filtered_orders(
    state: &AppState,
    query: &OrdersQuery,
) -> Result<Vec<OrderSummary>, Response> {
    let (_, orders) = scoped_orders(state, query).await?;
    let mut rows = orders
        .iter()
        .map(|order| OrderSummary::from_order(state, order))
        .filter(|row| query.admits(row))
        .collect::<Vec<_>>();
    sort_rows(&mut rows, query.sort.as_deref());
    Ok(rows)
}

/// Mirror order (date, then series) unless the caller asks otherwise.
fn sort_rows(rows: &mut [OrderSummary], sort: Option<&str>) {
    match sort.unwrap_or_default() {
        "percent_asc" => rows.sort_by(|a, b| a.completion_percent.total_cmp(&b.completion_percent)),
        "percent_desc" => rows.sort_by(|a, b| b.completion_percent.total_cmp(&a.completion_percent)),
        "series_asc" => rows.sort_by_key(|r| r.series),
        "series_desc" => rows.sort_by_key(|r| std::cmp::Reverse(r.series)),
        _ => {}
    }
}

fn paginate(rows: Vec<OrderSummary>, query: &OrdersQuery) -> OrderPage {
    let total = rows.len();
    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let orders = rows.into_iter().skip(start).take(per_page).collect();
    OrderPage {
        total,
        page,
        per_page,
        total_pages,
        orders,
    }
}

fn order_detail(state: &AppState, order: &MirrorOrder) -> OrderDetail {
    let item_summary = order.items.iter().fold(
        ItemSummary {
            count: order.items.len(),
            ..Default::default()
        },
        |acc, item| ItemSummary {
            planned_qty: acc.planned_qty + item.planned_qty.unwrap_or(0.0),
            produced_qty: acc.produced_qty + item.produced_qty.unwrap_or(0.0),
            remaining_qty: acc.remaining_qty + item.remaining_qty.unwrap_or(0.0),
            ..acc
        },
    );
    let items = order
        .items
        .iter()
        .map(|item| ItemView {
            item_id: item.id,
            lot: item.lot,
            product_code: item.product_code,
            product_description: item.product_description.clone(),
            color_code: item.color_code,
            color_name: item.color_name.clone(),
            planned_qty: item.planned_qty,
            produced_qty: item.produced_qty,
            remaining_qty: item.remaining_qty,
        })
        .collect();
    let stage_status = order
        .stages
        .iter()
        .flatten()
        .map(|s| (s.key, s.status))
        .collect::<BTreeMap<_, _>>();
    let routing = order.routing.as_ref().map(|steps| {
        steps
            .iter()
            .map(|step| RoutingView {
                stage_id: step.stage_id,
                stage_name: state.stage_names.get(&step.stage_id).cloned(),
                sequence: step.sequence,
                started_at: step.started_at,
                finished_at: step.finished_at,
                status_code: step.status_code.clone(),
                status: stage_status.get(&step.key()).copied(),
            })
            .collect()
    });
    OrderDetail {
        order: OrderSummary::from_order(state, order),
        item_summary,
        paint: paint_totals(&order.items, &state.paint).into(),
        items,
        routing,
    }
}

fn dashboard(rows: &[OrderSummary]) -> Dashboard {
    let mut out = Dashboard {
        total_orders: rows.len(),
        ..Default::default()
    };
    for row in rows {
        *out.by_status.entry(row.status_name.clone()).or_default() += 1;
        *out.by_color.entry(row.resolved_color.clone()).or_default() += 1;
    }
    if !rows.is_empty() {
        let sum: f64 = rows.iter().map(|r| r.completion_percent).sum();
        out.average_completion = opmirror_core::derive::round2(sum / rows.len() as f64);
    }
    out
}

fn load_runs(reports_dir: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let dir = entry?.path();
        let summary_path = dir.join(reports::SUMMARY_FILE);
        let Ok(raw) = std::fs::read(&summary_path) else {
            continue;
        };
        let summary: SyncRunSummary = match serde_json::from_slice(&raw) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(path = %summary_path.display(), error = %err, "skipping unreadable run summary");
                continue;
            }
        };
        runs.push((
            summary.finished_at,
            RunReportRow {
                run_id: summary.run_id.to_string(),
                finished_at: summary.finished_at.to_rfc3339(),
                dry_run: summary.dry_run,
                selected: summary.selected,
                succeeded: summary.succeeded,
                failed: summary.failed,
                has_parquet_manifest: Path::new(&summary.parquet_manifest).exists(),
            },
        ));
    }
    runs.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(runs.into_iter().take(limit).map(|(_, row)| row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use opmirror_core::{derive_order, OrderHeader, OrderItem, RoutingStep, StageCodeTable};
    use opmirror_storage::{MemoryMirror, MirrorStore, RowChanges};
    use tower::ServiceExt;

    fn at(y: i32, m: u32, d: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0)
    }

    fn header(id: i64, status: &str, valid_until: Option<NaiveDateTime>) -> OrderHeader {
        OrderHeader {
            id,
            series: id + 4000,
            filial: Some(1),
            description: Some(format!("Portao {id}")),
            status_code: Some(status.into()),
            valid_until,
            planned_qty: Some(10.0),
            remaining_qty: Some(10.0),
            ..Default::default()
        }
    }

    fn item(id: i64, order_id: i64, product: i64, color: Option<&str>, remaining: f64) -> OrderItem {
        OrderItem {
            id,
            order_id,
            order_series: Some(order_id + 4000),
            product_code: Some(product),
            color_name: color.map(str::to_string),
            planned_qty: Some(10.0),
            produced_qty: Some(10.0 - remaining),
            remaining_qty: Some(remaining),
            ..Default::default()
        }
    }

    /// Three orders synced without a paint catalog, so order 3 was stored as "NO PAINT".
    async fn seeded_mirror() -> Arc<MemoryMirror> {
        let mirror = Arc::new(MemoryMirror::new());
        let routing = Some(vec![
            RoutingStep {
                order_series: 4001,
                stage_id: 1,
                sequence: 1,
                started_at: at(2025, 10, 1),
                finished_at: at(2025, 10, 2),
                status_code: None,
            },
            RoutingStep {
                order_series: 4001,
                stage_id: 4,
                sequence: 2,
                started_at: None,
                finished_at: None,
                status_code: None,
            },
        ]);
        let orders = vec![
            derive_order(
                header(1, "AA", at(2025, 10, 10)),
                vec![item(11, 1, 100, Some("Azul"), 4.0)],
                routing,
                &PaintCatalog::default(),
                &StageCodeTable::default(),
            ),
            derive_order(
                header(2, "IN", at(2025, 10, 20)),
                vec![item(21, 2, 100, Some("Verde"), 0.0)],
                None,
                &PaintCatalog::default(),
                &StageCodeTable::default(),
            ),
            derive_order(
                header(3, "AA", at(2025, 11, 5)),
                vec![item(31, 3, 300, None, 10.0)],
                None,
                &PaintCatalog::default(),
                &StageCodeTable::default(),
            ),
        ];
        let mut run = mirror.begin_run().await.unwrap();
        for order in &orders {
            run.apply_order(order).await.unwrap();
        }
        run.commit().await.unwrap();
        mirror
    }

    async fn test_app() -> Router {
        let state = AppState::new(seeded_mirror().await)
            .with_paint(PaintCatalog::from_entries([(300, "Epóxi Cinza".to_string())]))
            .with_stage_names(BTreeMap::from([(1, "Perfiladeira".to_string()), (4, "Pintura".to_string())]));
        app(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_json(test_app().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn orders_recompute_color_with_current_paint_catalog() {
        let (status, body) = get_json(test_app().await, "/orders").await;
        assert_eq!(status, StatusCode::OK);
        let page: OrderPage = serde_json::from_value(body).unwrap();
        assert_eq!(page.total, 3);
        let ids = page.orders.iter().map(|o| o.order_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(page.orders[0].resolved_color, "Epóxi Cinza");
    }

    #[tokio::test]
    async fn orders_filter_by_status_color_and_percent() {
        let app = test_app().await;
        let (_, body) = get_json(app.clone(), "/orders?status=open").await;
        assert_eq!(body["total"], 2);

        let (_, body) = get_json(app.clone(), "/orders?color_contains=EP%C3%B3xi").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["orders"][0]["order_id"], 3);

        let (_, body) = get_json(app.clone(), "/orders?percent_min=80").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["orders"][0]["order_id"], 2);

        let (_, body) = get_json(app, "/orders?from=2025-10-01&to=2025-10-31&sort=series_asc").await;
        let ids = body["orders"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["order_id"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn inverted_window_is_a_bad_request() {
        let (status, body) = get_json(test_app().await, "/orders?from=2025-11-01&to=2025-10-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("after"));
    }

    #[tokio::test]
    async fn orders_paginate() {
        let (_, body) = get_json(test_app().await, "/orders?per_page=2&page=2").await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["orders"].as_array().unwrap().len(), 1);
    }

    async fn mirror_of(orders: &[MirrorOrder]) -> Arc<MemoryMirror> {
        let mirror = Arc::new(MemoryMirror::new());
        let mut run = mirror.begin_run().await.unwrap();
        for order in orders {
            run.apply_order(order).await.unwrap();
        }
        run.commit().await.unwrap();
        mirror
    }

    fn described(mut item: OrderItem, description: &str) -> OrderItem {
        item.product_description = Some(description.to_string());
        item
    }

    fn derived(header: OrderHeader, items: Vec<OrderItem>) -> MirrorOrder {
        derive_order(header, items, None, &PaintCatalog::default(), &StageCodeTable::default())
    }

    #[tokio::test]
    async fn paint_queue_lists_orders_waiting_only_on_paint() {
        let orders = vec![
            derived(
                header(1, "AA", at(2025, 11, 1)),
                vec![item(11, 1, 100, None, 0.0), item(12, 1, 300, None, 5.0)],
            ),
            derived(
                header(2, "IN", at(2025, 10, 15)),
                vec![
                    item(21, 2, 100, None, 0.0),
                    described(item(22, 2, 400, None, 2.0), "Tinta eletrostatica"),
                ],
            ),
            derived(header(3, "AA", None), vec![item(31, 3, 300, None, 3.0)]),
            derived(
                header(4, "AA", at(2025, 10, 1)),
                vec![item(41, 4, 100, None, 1.0), item(42, 4, 300, None, 5.0)],
            ),
            derived(header(5, "AA", at(2025, 10, 2)), vec![item(51, 5, 300, None, 0.0)]),
        ];
        let state = AppState::new(mirror_of(&orders).await)
            .with_paint(PaintCatalog::from_entries([(300, "Epóxi Cinza".to_string())]));
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/paint/queue").await;
        assert_eq!(status, StatusCode::OK);
        let queue: PaintQueue = serde_json::from_value(body).unwrap();
        let ids = queue.orders.iter().map(|r| r.order.order_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(queue.count, 3);
        assert_eq!(queue.orders[0].paint.remaining_m2, 2.0);
        assert_eq!(queue.orders[1].order.resolved_color, "Epóxi Cinza");
        assert_eq!(
            queue.orders[1].paint,
            PaintSummary {
                planned_m2: 10.0,
                produced_m2: 5.0,
                remaining_m2: 5.0
            }
        );

        let (_, body) = get_json(app.clone(), "/paint/queue?limit=1").await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["orders"][0]["order"]["order_id"], 2);

        let (_, body) = get_json(app, "/paint/queue?status=started").await;
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn order_detail_reports_paint_square_meters() {
        let app = test_app().await;
        let (_, body) = get_json(app.clone(), "/orders/3").await;
        let detail: OrderDetail = serde_json::from_value(body).unwrap();
        assert_eq!(
            detail.paint,
            PaintSummary {
                planned_m2: 10.0,
                produced_m2: 0.0,
                remaining_m2: 10.0
            }
        );

        let (_, body) = get_json(app, "/orders/1").await;
        let detail: OrderDetail = serde_json::from_value(body).unwrap();
        assert_eq!(detail.paint, PaintSummary::default());
    }

    #[tokio::test]
    async fn order_detail_names_stages_and_404s_when_missing() {
        let app = test_app().await;
        let (status, body) = get_json(app.clone(), "/orders/1").await;
        assert_eq!(status, StatusCode::OK);
        let detail: OrderDetail = serde_json::from_value(body).unwrap();
        assert_eq!(detail.order.resolved_color, "Azul");
        assert_eq!(detail.item_summary.count, 1);
        assert_eq!(detail.item_summary.remaining_qty, 4.0);
        let routing = detail.routing.unwrap();
        assert_eq!(routing[0].stage_name.as_deref(), Some("Perfiladeira"));
        assert_eq!(routing[0].status, Some(StageStatus::Done));
        assert_eq!(routing[1].status, Some(StageStatus::Pending));

        let (status, _) = get_json(app, "/orders/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dashboard_aggregates_by_status_and_color() {
        let (status, body) = get_json(test_app().await, "/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        let dash: Dashboard = serde_json::from_value(body).unwrap();
        assert_eq!(dash.total_orders, 3);
        assert_eq!(dash.by_status["OPEN"], 2);
        assert_eq!(dash.by_status["STARTED"], 1);
        assert_eq!(dash.by_color["Epóxi Cinza"], 1);
        assert_eq!(dash.by_color["Azul"], 1);
        // (60 + 100 + 0) / 3
        assert_eq!(dash.average_completion, 53.33);
    }

    #[tokio::test]
    async fn runs_are_empty_without_a_reports_dir() {
        let (status, body) = get_json(test_app().await, "/runs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    fn write_run(root: &Path, dir: &str, run: u32, finished_at: &str, manifest: &Path) {
        let window = SyncWindow::explicit(
            NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 31).unwrap(),
        )
        .unwrap();
        let summary = SyncRunSummary {
            run_id: format!("00000000-0000-0000-0000-{run:012}").parse().unwrap(),
            started_at: finished_at.parse().unwrap(),
            finished_at: finished_at.parse().unwrap(),
            source: "snapshot".to_string(),
            mirror: "memory".to_string(),
            filial: 1,
            date_field: DateField::default(),
            window,
            statuses: vec!["AA".to_string()],
            dry_run: run % 2 == 0,
            selected: run as usize,
            succeeded: run as usize,
            failed: 0,
            failures: Vec::new(),
            routing_table: None,
            routing_warning: None,
            paint_catalog: "empty".to_string(),
            rows_changed: RowChanges::default(),
            orders: Vec::new(),
            reports_dir: root.display().to_string(),
            parquet_manifest: manifest.display().to_string(),
        };
        let run_dir = root.join(dir);
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(
            run_dir.join(reports::SUMMARY_FILE),
            serde_json::to_vec_pretty(&summary).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn runs_list_newest_first_and_skip_unreadable_summaries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let manifest = root.join("b").join(reports::SNAPSHOTS_DIR).join(reports::MANIFEST_FILE);
        write_run(root, "a", 1, "2025-10-01T06:00:00Z", &root.join("a/missing.json"));
        write_run(root, "b", 2, "2025-10-03T06:00:00Z", &manifest);
        write_run(root, "c", 3, "2025-10-02T18:00:00Z", &root.join("c/missing.json"));
        std::fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        std::fs::write(&manifest, b"{}").unwrap();
        std::fs::create_dir_all(root.join("garbage")).unwrap();
        std::fs::write(root.join("garbage").join(reports::SUMMARY_FILE), b"{not json").unwrap();
        std::fs::create_dir_all(root.join("in-progress")).unwrap();
        std::fs::write(root.join("notes.txt"), b"stray file").unwrap();

        let state = AppState::new(seeded_mirror().await).with_reports_dir(root);
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/runs").await;
        assert_eq!(status, StatusCode::OK);
        let runs: Vec<RunReportRow> = serde_json::from_value(body).unwrap();
        let ids = runs.iter().map(|r| r.run_id.as_str()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                "00000000-0000-0000-0000-000000000002",
                "00000000-0000-0000-0000-000000000003",
                "00000000-0000-0000-0000-000000000001",
            ]
        );
        assert_eq!(
            runs.iter().map(|r| r.has_parquet_manifest).collect::<Vec<_>>(),
            vec![true, false, false]
        );
        assert!(runs[0].dry_run);
        assert_eq!(runs[1].selected, 3);

        let (_, body) = get_json(app, "/runs?limit=2").await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[1]["run_id"], "00000000-0000-0000-0000-000000000003");

        assert_eq!(load_runs(&root.join("nope"), 5).unwrap().len(), 0);
    }

    #[test]
    fn shipped_stage_names_parse() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/stages.yaml");
        let names = load_stage_names(&path).unwrap();
        assert_eq!(names.get(&4).map(String::as_str), Some("Pintura"));
    }
}
