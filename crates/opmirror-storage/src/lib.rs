//! The mirror: a fixed relational schema the sync writes and the query API reads.

pub mod memory;
pub mod postgres;

use std::ops::AddAssign;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use opmirror_core::{DateField, MirrorOrder, OrderId, PaintCatalog, SyncWindow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use memory::MemoryMirror;
pub use postgres::PgMirror;

pub const CRATE_NAME: &str = "opmirror-storage";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("order {order_id} violates mirror integrity: {message}")]
    Integrity { order_id: OrderId, message: String },
    #[error("order {0} is not in the mirror")]
    OrderMissing(OrderId),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Rows inserted, updated or deleted, per mirror table. No-op upserts count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChanges {
    pub headers: u64,
    pub items: u64,
    pub routing_steps: u64,
    pub stage_progress: u64,
}

impl RowChanges {
    pub fn total(&self) -> u64 {
        self.headers + self.items + self.routing_steps + self.stage_progress
    }
}

impl AddAssign for RowChanges {
    fn add_assign(&mut self, rhs: Self) {
        self.headers += rhs.headers;
        self.items += rhs.items;
        self.routing_steps += rhs.routing_steps;
        self.stage_progress += rhs.stage_progress;
    }
}

/// Write side of the mirror.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    fn describe(&self) -> String;

    /// Creates the mirror tables when missing. Failing here is fatal for a run.
    async fn ensure_schema(&self) -> Result<(), MirrorError>;

    /// Opens the single transaction a sync run writes through.
    async fn begin_run(&self) -> Result<Box<dyn MirrorRun>, MirrorError>;

    async fn load_paint_catalog(&self) -> Result<PaintCatalog, MirrorError>;
}

/// One run's transaction. Each `apply_order` is atomic on its own; nothing is visible to
/// readers until `commit`.
#[async_trait]
pub trait MirrorRun: Send {
    async fn apply_order(&mut self, order: &MirrorOrder) -> Result<RowChanges, MirrorError>;
    async fn commit(self: Box<Self>) -> Result<(), MirrorError>;
    async fn rollback(self: Box<Self>) -> Result<(), MirrorError>;
}

/// Read filter for listing mirrored orders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderScope {
    pub filial: Option<i64>,
    pub date_field: DateField,
    /// Orders with no value in `date_field` fall outside any window.
    pub window: Option<SyncWindow>,
    /// Humanized status names (`OPEN`, `STARTED`, ...); empty means all.
    pub status_names: Vec<String>,
}

impl OrderScope {
    pub fn admits_status(&self, status_name: &str) -> bool {
        self.status_names.is_empty()
            || self
                .status_names
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(status_name))
    }
}

/// Read side of the mirror.
#[async_trait]
pub trait MirrorReader: Send + Sync {
    /// Headers and items only; `routing`/`stages` are left as `None`.
    /// Ordered by the scope's date (newest first, missing last) then series.
    async fn list_orders(&self, scope: &OrderScope) -> Result<Vec<MirrorOrder>, MirrorError>;

    /// Full order including routing and stage progress.
    async fn load_order(&self, order_id: OrderId) -> Result<Option<MirrorOrder>, MirrorError>;
}

#[derive(Debug, Deserialize)]
struct PaintYaml {
    #[serde(default)]
    paint: PaintCatalog,
}

pub fn load_paint_yaml(path: &Path) -> anyhow::Result<PaintCatalog> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: PaintYaml =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(PaintCatalog::from_entries(
        parsed
            .paint
            .observations()
            .filter(|(_, note)| !note.trim().is_empty())
            .map(|(code, note)| (code, note.trim().to_string())),
    ))
}

/// Paint observations as both the sync and the query API see them: the configured YAML
/// first, then the mirror's own table, then nothing. Returns the catalog and where it came
/// from; never fails.
pub async fn load_paint_catalog_or_empty(
    paint_rules: Option<&Path>,
    store: &dyn MirrorStore,
) -> (PaintCatalog, String) {
    if let Some(path) = paint_rules {
        match load_paint_yaml(path) {
            Ok(catalog) => {
                let label = format!("{} ({} entries)", path.display(), catalog.len());
                return (catalog, label);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "paint rules unreadable; trying the mirror");
            }
        }
    }
    match store.load_paint_catalog().await {
        Ok(catalog) => {
            let label = format!("mirror paint_config ({} entries)", catalog.len());
            (catalog, label)
        }
        Err(err) => {
            warn!(error = %err, "paint catalog unavailable; color fallback skips paint observations");
            (PaintCatalog::default(), "empty".to_string())
        }
    }
}
