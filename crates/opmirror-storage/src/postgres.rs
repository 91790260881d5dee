//! Postgres mirror over sqlx.

use async_trait::async_trait;
use opmirror_core::{
    DateField, MirrorOrder, OrderHeader, OrderId, OrderItem, PaintCatalog, RoutingStep, StageKey,
    StageProgress, StageStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Acquire, PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::{MirrorError, MirrorReader, MirrorRun, MirrorStore, OrderScope, RowChanges};

const SCHEMA: [&str; 8] = [
    r#"
    CREATE TABLE IF NOT EXISTS order_header (
        order_id            BIGINT PRIMARY KEY,
        order_series        BIGINT NOT NULL UNIQUE,
        filial              BIGINT,
        description         TEXT,
        sales_order         BIGINT,
        status_code         TEXT,
        status_name         TEXT NOT NULL,
        issued_at           TIMESTAMP,
        planned_start_at    TIMESTAMP,
        valid_until         TIMESTAMP,
        planned_qty         DOUBLE PRECISION,
        produced_qty        DOUBLE PRECISION,
        remaining_qty       DOUBLE PRECISION,
        header_color        TEXT,
        resolved_color      TEXT NOT NULL,
        completion_percent  DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS order_item (
        item_id             BIGINT PRIMARY KEY,
        order_id            BIGINT NOT NULL REFERENCES order_header(order_id) ON DELETE CASCADE,
        order_series        BIGINT,
        lot                 BIGINT,
        product_code        BIGINT,
        product_description TEXT,
        color_code          BIGINT,
        color_name          TEXT,
        planned_qty         DOUBLE PRECISION,
        produced_qty        DOUBLE PRECISION,
        remaining_qty       DOUBLE PRECISION
    )
    "#,
    "CREATE INDEX IF NOT EXISTS order_item_order_id_idx ON order_item (order_id)",
    r#"
    CREATE TABLE IF NOT EXISTS routing_step (
        order_series  BIGINT NOT NULL,
        stage_id      BIGINT NOT NULL,
        sequence      BIGINT NOT NULL,
        started_at    TIMESTAMP,
        finished_at   TIMESTAMP,
        status_code   TEXT,
        PRIMARY KEY (order_series, stage_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stage_progress (
        order_series  BIGINT NOT NULL,
        stage_id      BIGINT NOT NULL,
        sequence      BIGINT NOT NULL,
        status        TEXT NOT NULL CHECK (status IN ('PENDING', 'IN_PROGRESS', 'DONE')),
        started_at    TIMESTAMP,
        finished_at   TIMESTAMP,
        PRIMARY KEY (order_series, stage_id, sequence)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS stage_progress_series_idx ON stage_progress (order_series)",
    r#"
    CREATE TABLE IF NOT EXISTS paint_config (
        product_code  BIGINT PRIMARY KEY,
        observation   TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS order_header_filial_idx ON order_header (filial)",
];

const HEADER_SELECT: &str = r#"
    SELECT order_id, order_series, filial, description, sales_order, status_code, status_name,
           issued_at, planned_start_at, valid_until, planned_qty, produced_qty, remaining_qty,
           header_color, resolved_color, completion_percent
      FROM order_header
"#;

const ITEM_SELECT: &str = r#"
    SELECT item_id, order_id, order_series, lot, product_code, product_description,
           color_code, color_name, planned_qty, produced_qty, remaining_qty
      FROM order_item
"#;

fn date_column(field: DateField) -> &'static str {
    match field {
        DateField::Issue => "issued_at",
        DateField::PlannedStart => "planned_start_at",
        DateField::Validity => "valid_until",
    }
}

#[derive(Debug, Clone)]
pub struct PgMirror {
    pool: PgPool,
}

impl PgMirror {
    pub async fn connect(database_url: &str) -> Result<Self, MirrorError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MirrorStore for PgMirror {
    fn describe(&self) -> String {
        "postgres".to_string()
    }

    async fn ensure_schema(&self) -> Result<(), MirrorError> {
        let mut conn = self.pool.acquire().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        info!(tables = 5, "mirror schema ready");
        Ok(())
    }

    async fn begin_run(&self) -> Result<Box<dyn MirrorRun>, MirrorError> {
        Ok(Box::new(PgMirrorRun {
            tx: self.pool.begin().await?,
        }))
    }

    async fn load_paint_catalog(&self) -> Result<PaintCatalog, MirrorError> {
        let rows = sqlx::query(
            r#"
            SELECT product_code, observation
              FROM paint_config
             WHERE TRIM(COALESCE(observation, '')) <> ''
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut catalog = PaintCatalog::new();
        for row in rows {
            let code: i64 = row.try_get("product_code")?;
            let note: String = row.try_get("observation")?;
            catalog.insert(code, note.trim());
        }
        Ok(catalog)
    }
}

struct PgMirrorRun {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MirrorRun for PgMirrorRun {
    /// Runs inside a savepoint so a failing order leaves the run transaction usable.
    async fn apply_order(&mut self, order: &MirrorOrder) -> Result<RowChanges, MirrorError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        match write_order(&mut savepoint, order).await {
            Ok(changes) => {
                savepoint.commit().await?;
                Ok(changes)
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err)
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), MirrorError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MirrorError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn write_order(conn: &mut PgConnection, order: &MirrorOrder) -> Result<RowChanges, MirrorError> {
    let mut changes = RowChanges {
        headers: upsert_header(conn, order).await?,
        items: upsert_items(conn, order).await?,
        ..Default::default()
    };
    if let Some(routing) = &order.routing {
        changes.routing_steps = upsert_routing(conn, order.header.series, routing).await?;
    }
    if let Some(stages) = &order.stages {
        changes.stage_progress = upsert_stages(conn, order.header.series, stages).await?;
    }
    debug!(order_id = order.header.id, ?changes, "order written to mirror");
    Ok(changes)
}

async fn upsert_header(conn: &mut PgConnection, order: &MirrorOrder) -> Result<u64, MirrorError> {
    let h = &order.header;
    let result = sqlx::query(
        r#"
        INSERT INTO order_header (
            order_id, order_series, filial, description, sales_order, status_code, status_name,
            issued_at, planned_start_at, valid_until, planned_qty, produced_qty, remaining_qty,
            header_color, resolved_color, completion_percent
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (order_id) DO UPDATE SET
            order_series = EXCLUDED.order_series,
            filial = EXCLUDED.filial,
            description = EXCLUDED.description,
            sales_order = EXCLUDED.sales_order,
            status_code = EXCLUDED.status_code,
            status_name = EXCLUDED.status_name,
            issued_at = EXCLUDED.issued_at,
            planned_start_at = EXCLUDED.planned_start_at,
            valid_until = EXCLUDED.valid_until,
            planned_qty = EXCLUDED.planned_qty,
            produced_qty = EXCLUDED.produced_qty,
            remaining_qty = EXCLUDED.remaining_qty,
            header_color = EXCLUDED.header_color,
            resolved_color = EXCLUDED.resolved_color,
            completion_percent = EXCLUDED.completion_percent
        WHERE (
            order_header.order_series, order_header.filial, order_header.description,
            order_header.sales_order, order_header.status_code, order_header.status_name,
            order_header.issued_at, order_header.planned_start_at, order_header.valid_until,
            order_header.planned_qty, order_header.produced_qty, order_header.remaining_qty,
            order_header.header_color, order_header.resolved_color, order_header.completion_percent
        ) IS DISTINCT FROM (
            EXCLUDED.order_series, EXCLUDED.filial, EXCLUDED.description,
            EXCLUDED.sales_order, EXCLUDED.status_code, EXCLUDED.status_name,
            EXCLUDED.issued_at, EXCLUDED.planned_start_at, EXCLUDED.valid_until,
            EXCLUDED.planned_qty, EXCLUDED.produced_qty, EXCLUDED.remaining_qty,
            EXCLUDED.header_color, EXCLUDED.resolved_color, EXCLUDED.completion_percent
        )
        "#,
    )
    .bind(h.id)
    .bind(h.series)
    .bind(h.filial)
    .bind(&h.description)
    .bind(h.sales_order)
    .bind(&h.status_code)
    .bind(&order.status_name)
    .bind(h.issued_at)
    .bind(h.planned_start_at)
    .bind(h.valid_until)
    .bind(h.planned_qty)
    .bind(h.produced_qty)
    .bind(h.remaining_qty)
    .bind(&h.color_text)
    .bind(&order.resolved_color)
    .bind(order.completion_percent)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_items(conn: &mut PgConnection, order: &MirrorOrder) -> Result<u64, MirrorError> {
    let order_id = order.header.id;
    if let Some(item) = order.items.iter().find(|item| item.order_id != order_id) {
        return Err(MirrorError::Integrity {
            order_id,
            message: format!("item {} references order {}", item.id, item.order_id),
        });
    }

    let mut written = 0;
    if !order.items.is_empty() {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO order_item (item_id, order_id, order_series, lot, product_code, \
             product_description, color_code, color_name, planned_qty, produced_qty, remaining_qty) ",
        );
        qb.push_values(&order.items, |mut b, item| {
            b.push_bind(item.id)
                .push_bind(item.order_id)
                .push_bind(item.order_series)
                .push_bind(item.lot)
                .push_bind(item.product_code)
                .push_bind(item.product_description.clone())
                .push_bind(item.color_code)
                .push_bind(item.color_name.clone())
                .push_bind(item.planned_qty)
                .push_bind(item.produced_qty)
                .push_bind(item.remaining_qty);
        });
        qb.push(
            r#"
            ON CONFLICT (item_id) DO UPDATE SET
                order_id = EXCLUDED.order_id,
                order_series = EXCLUDED.order_series,
                lot = EXCLUDED.lot,
                product_code = EXCLUDED.product_code,
                product_description = EXCLUDED.product_description,
                color_code = EXCLUDED.color_code,
                color_name = EXCLUDED.color_name,
                planned_qty = EXCLUDED.planned_qty,
                produced_qty = EXCLUDED.produced_qty,
                remaining_qty = EXCLUDED.remaining_qty
            WHERE (
                order_item.order_id, order_item.order_series, order_item.lot,
                order_item.product_code, order_item.product_description, order_item.color_code,
                order_item.color_name, order_item.planned_qty, order_item.produced_qty,
                order_item.remaining_qty
            ) IS DISTINCT FROM (
                EXCLUDED.order_id, EXCLUDED.order_series, EXCLUDED.lot,
                EXCLUDED.product_code, EXCLUDED.product_description, EXCLUDED.color_code,
                EXCLUDED.color_name, EXCLUDED.planned_qty, EXCLUDED.produced_qty,
                EXCLUDED.remaining_qty
            )
            "#,
        );
        written = qb.build().execute(&mut *conn).await?.rows_affected();
    }

    let keep = order.items.iter().map(|item| item.id).collect::<Vec<_>>();
    let pruned = sqlx::query("DELETE FROM order_item WHERE order_id = $1 AND NOT (item_id = ANY($2))")
        .bind(order_id)
        .bind(&keep)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(written + pruned)
}

/// Deletes keyed rows of `table` for `series` whose (stage, sequence) is not in `keep`.
async fn prune_stage_keys(
    conn: &mut PgConnection,
    table: &'static str,
    series: i64,
    keep: impl Iterator<Item = StageKey>,
) -> Result<u64, MirrorError> {
    let (stages, sequences): (Vec<i64>, Vec<i64>) =
        keep.map(|key| (key.stage_id, key.sequence)).unzip();
    let sql = format!(
        "DELETE FROM {table} WHERE order_series = $1 \
         AND (stage_id, sequence) NOT IN (SELECT * FROM UNNEST($2::bigint[], $3::bigint[]))"
    );
    Ok(sqlx::query(&sql)
        .bind(series)
        .bind(&stages)
        .bind(&sequences)
        .execute(&mut *conn)
        .await?
        .rows_affected())
}

async fn upsert_routing(
    conn: &mut PgConnection,
    series: i64,
    steps: &[RoutingStep],
) -> Result<u64, MirrorError> {
    let mut written = 0;
    if !steps.is_empty() {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO routing_step (order_series, stage_id, sequence, started_at, finished_at, status_code) ",
        );
        qb.push_values(steps, |mut b, step| {
            b.push_bind(series)
                .push_bind(step.stage_id)
                .push_bind(step.sequence)
                .push_bind(step.started_at)
                .push_bind(step.finished_at)
                .push_bind(step.status_code.clone());
        });
        qb.push(
            r#"
            ON CONFLICT (order_series, stage_id, sequence) DO UPDATE SET
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                status_code = EXCLUDED.status_code
            WHERE (routing_step.started_at, routing_step.finished_at, routing_step.status_code)
                IS DISTINCT FROM (EXCLUDED.started_at, EXCLUDED.finished_at, EXCLUDED.status_code)
            "#,
        );
        written = qb.build().execute(&mut *conn).await?.rows_affected();
    }
    let pruned = prune_stage_keys(conn, "routing_step", series, steps.iter().map(RoutingStep::key)).await?;
    Ok(written + pruned)
}

async fn upsert_stages(
    conn: &mut PgConnection,
    series: i64,
    stages: &[StageProgress],
) -> Result<u64, MirrorError> {
    let mut written = 0;
    if !stages.is_empty() {
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO stage_progress (order_series, stage_id, sequence, status, started_at, finished_at) ",
        );
        qb.push_values(stages, |mut b, stage| {
            b.push_bind(series)
                .push_bind(stage.key.stage_id)
                .push_bind(stage.key.sequence)
                .push_bind(stage.status.as_str())
                .push_bind(stage.started_at)
                .push_bind(stage.finished_at);
        });
        qb.push(
            r#"
            ON CONFLICT (order_series, stage_id, sequence) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            WHERE (stage_progress.status, stage_progress.started_at, stage_progress.finished_at)
                IS DISTINCT FROM (EXCLUDED.status, EXCLUDED.started_at, EXCLUDED.finished_at)
            "#,
        );
        written = qb.build().execute(&mut *conn).await?.rows_affected();
    }
    let pruned = prune_stage_keys(conn, "stage_progress", series, stages.iter().map(|s| s.key)).await?;
    Ok(written + pruned)
}

struct HeaderRecord {
    header: OrderHeader,
    status_name: String,
    completion_percent: f64,
    resolved_color: String,
}

fn header_from_row(row: &PgRow) -> Result<HeaderRecord, sqlx::Error> {
    Ok(HeaderRecord {
        header: OrderHeader {
            id: row.try_get("order_id")?,
            series: row.try_get("order_series")?,
            filial: row.try_get("filial")?,
            description: row.try_get("description")?,
            sales_order: row.try_get("sales_order")?,
            status_code: row.try_get("status_code")?,
            issued_at: row.try_get("issued_at")?,
            planned_start_at: row.try_get("planned_start_at")?,
            valid_until: row.try_get("valid_until")?,
            planned_qty: row.try_get("planned_qty")?,
            produced_qty: row.try_get("produced_qty")?,
            remaining_qty: row.try_get("remaining_qty")?,
            color_text: row.try_get("header_color")?,
        },
        status_name: row.try_get("status_name")?,
        completion_percent: row.try_get("completion_percent")?,
        resolved_color: row.try_get("resolved_color")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<OrderItem, sqlx::Error> {
    Ok(OrderItem {
        id: row.try_get("item_id")?,
        order_id: row.try_get("order_id")?,
        order_series: row.try_get("order_series")?,
        lot: row.try_get("lot")?,
        product_code: row.try_get("product_code")?,
        product_description: row.try_get("product_description")?,
        color_code: row.try_get("color_code")?,
        color_name: row.try_get("color_name")?,
        planned_qty: row.try_get("planned_qty")?,
        produced_qty: row.try_get("produced_qty")?,
        remaining_qty: row.try_get("remaining_qty")?,
    })
}

fn assemble(record: HeaderRecord, items: Vec<OrderItem>) -> MirrorOrder {
    MirrorOrder {
        header: record.header,
        status_name: record.status_name,
        completion_percent: record.completion_percent,
        resolved_color: record.resolved_color,
        items,
        routing: None,
        stages: None,
    }
}

#[async_trait]
impl MirrorReader for PgMirror {
    async fn list_orders(&self, scope: &OrderScope) -> Result<Vec<MirrorOrder>, MirrorError> {
        let date_col = date_column(scope.date_field);
        let mut qb = QueryBuilder::<Postgres>::new(HEADER_SELECT);
        qb.push(" WHERE TRUE");
        if let Some(filial) = scope.filial {
            qb.push(" AND filial = ").push_bind(filial);
        }
        if let Some(window) = scope.window {
            qb.push(format!(" AND {date_col}::date BETWEEN "))
                .push_bind(window.from)
                .push(" AND ")
                .push_bind(window.to);
        }
        if !scope.status_names.is_empty() {
            let names = scope
                .status_names
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .collect::<Vec<_>>();
            qb.push(" AND status_name = ANY(").push_bind(names).push(")");
        }
        qb.push(format!(" ORDER BY {date_col} DESC NULLS LAST, order_series DESC"));

        let headers = qb
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(header_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let ids = headers.iter().map(|h| h.header.id).collect::<Vec<_>>();
        let item_rows = sqlx::query(&format!(
            "{ITEM_SELECT} WHERE order_id = ANY($1) ORDER BY order_id, item_id"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let mut items = item_rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(headers
            .into_iter()
            .map(|record| {
                let id = record.header.id;
                let (mine, rest): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut items).into_iter().partition(|i| i.order_id == id);
                items = rest;
                assemble(record, mine)
            })
            .collect())
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Option<MirrorOrder>, MirrorError> {
        let Some(row) = sqlx::query(&format!("{HEADER_SELECT} WHERE order_id = $1"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let record = header_from_row(&row)?;
        let series = record.header.series;

        let items = sqlx::query(&format!("{ITEM_SELECT} WHERE order_id = $1 ORDER BY item_id"))
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let routing = sqlx::query(
            r#"
            SELECT order_series, stage_id, sequence, started_at, finished_at, status_code
              FROM routing_step
             WHERE order_series = $1
             ORDER BY sequence, stage_id
            "#,
        )
        .bind(series)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<RoutingStep, sqlx::Error> {
            Ok(RoutingStep {
                order_series: row.try_get("order_series")?,
                stage_id: row.try_get("stage_id")?,
                sequence: row.try_get("sequence")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                status_code: row.try_get("status_code")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        let stages = sqlx::query(
            r#"
            SELECT order_series, stage_id, sequence, status, started_at, finished_at
              FROM stage_progress
             WHERE order_series = $1
             ORDER BY sequence, stage_id
            "#,
        )
        .bind(series)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<StageProgress, MirrorError> {
            let status: String = row.try_get("status")?;
            let status = status.parse::<StageStatus>().map_err(|message| MirrorError::Integrity {
                order_id,
                message,
            })?;
            Ok(StageProgress {
                key: StageKey {
                    order_series: row.try_get("order_series")?,
                    stage_id: row.try_get("stage_id")?,
                    sequence: row.try_get("sequence")?,
                },
                status,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

        let mut order = assemble(record, items);
        order.routing = Some(routing);
        order.stages = Some(stages);
        Ok(Some(order))
    }
}
