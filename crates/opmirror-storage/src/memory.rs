//! In-process mirror with the same keys and integrity rules as the Postgres schema.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use opmirror_core::{
    MirrorOrder, OrderHeader, OrderId, OrderItem, OrderSeries, PaintCatalog, RoutingStep,
    StageKey, StageProgress,
};
use tokio::sync::Mutex;

use crate::{MirrorError, MirrorReader, MirrorRun, MirrorStore, OrderScope, RowChanges};

#[derive(Debug, Clone, PartialEq)]
struct HeaderRow {
    header: OrderHeader,
    status_name: String,
    completion_percent: f64,
    resolved_color: String,
}

#[derive(Debug, Clone, Default)]
struct MirrorState {
    headers: BTreeMap<OrderId, HeaderRow>,
    /// Unique index on `headers[..].header.series`.
    series_owner: BTreeMap<OrderSeries, OrderId>,
    items: BTreeMap<i64, OrderItem>,
    routing: BTreeMap<StageKey, RoutingStep>,
    stages: BTreeMap<StageKey, StageProgress>,
    paint: PaintCatalog,
}

/// Inserts or replaces `value` under `key` unless it is already identical.
fn upsert<K: Ord, V: PartialEq>(map: &mut BTreeMap<K, V>, key: K, value: V) -> u64 {
    match map.get(&key) {
        Some(existing) if *existing == value => 0,
        _ => {
            map.insert(key, value);
            1
        }
    }
}

/// Replaces the rows of one order in a keyed table, returning rows written or removed.
fn sync_keyed<K, V>(
    map: &mut BTreeMap<K, V>,
    owned_by_order: impl Fn(&K, &V) -> bool,
    rows: impl IntoIterator<Item = (K, V)>,
) -> u64
where
    K: Ord + Clone,
    V: PartialEq,
{
    let mut changes = 0;
    let mut keep = BTreeSet::new();
    for (key, value) in rows {
        keep.insert(key.clone());
        changes += upsert(map, key, value);
    }
    let stale = map
        .iter()
        .filter(|(k, v)| owned_by_order(k, v) && !keep.contains(*k))
        .map(|(k, _)| k.clone())
        .collect::<Vec<_>>();
    for key in stale {
        map.remove(&key);
        changes += 1;
    }
    changes
}

impl MirrorState {
    /// Every check runs before the first write, so a rejected order leaves the state as it was.
    fn apply(&mut self, order: &MirrorOrder) -> Result<RowChanges, MirrorError> {
        let header = &order.header;
        let integrity = |message: String| MirrorError::Integrity {
            order_id: header.id,
            message,
        };
        if let Some(other) = self
            .series_owner
            .get(&header.series)
            .filter(|owner| **owner != header.id)
        {
            return Err(integrity(format!(
                "series {} already belongs to order {other}",
                header.series
            )));
        }
        if let Some(item) = order.items.iter().find(|item| item.order_id != header.id) {
            return Err(integrity(format!(
                "item {} references order {}",
                item.id, item.order_id
            )));
        }

        if let Some(previous) = self.headers.get(&header.id) {
            if previous.header.series != header.series {
                self.series_owner.remove(&previous.header.series);
            }
        }
        self.series_owner.insert(header.series, header.id);
        let mut changes = RowChanges {
            headers: upsert(
                &mut self.headers,
                header.id,
                HeaderRow {
                    header: header.clone(),
                    status_name: order.status_name.clone(),
                    completion_percent: order.completion_percent,
                    resolved_color: order.resolved_color.clone(),
                },
            ),
            ..Default::default()
        };
        changes.items = sync_keyed(
            &mut self.items,
            |_, item| item.order_id == header.id,
            order.items.iter().map(|item| (item.id, item.clone())),
        );
        if let Some(routing) = &order.routing {
            changes.routing_steps = sync_keyed(
                &mut self.routing,
                |key, _| key.order_series == header.series,
                routing.iter().map(|step| (step.key(), step.clone())),
            );
        }
        if let Some(stages) = &order.stages {
            changes.stage_progress = sync_keyed(
                &mut self.stages,
                |key, _| key.order_series == header.series,
                stages.iter().map(|stage| (stage.key, stage.clone())),
            );
        }
        Ok(changes)
    }

    fn assemble(&self, row: &HeaderRow, with_routing: bool) -> MirrorOrder {
        let series = row.header.series;
        let items = self
            .items
            .values()
            .filter(|item| item.order_id == row.header.id)
            .cloned()
            .collect();
        let (routing, stages) = if with_routing {
            (
                Some(
                    self.routing
                        .values()
                        .filter(|s| s.order_series == series)
                        .cloned()
                        .collect(),
                ),
                Some(
                    self.stages
                        .values()
                        .filter(|s| s.key.order_series == series)
                        .cloned()
                        .collect(),
                ),
            )
        } else {
            (None, None)
        };
        MirrorOrder {
            header: row.header.clone(),
            status_name: row.status_name.clone(),
            completion_percent: row.completion_percent,
            resolved_color: row.resolved_color.clone(),
            items,
            routing,
            stages,
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryMirror {
    state: Arc<Mutex<MirrorState>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paint(paint: PaintCatalog) -> Self {
        Self {
            state: Arc::new(Mutex::new(MirrorState {
                paint,
                ..Default::default()
            })),
        }
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.headers.len()
    }
}

struct MemoryRun {
    target: Arc<Mutex<MirrorState>>,
    working: MirrorState,
}

#[async_trait]
impl MirrorRun for MemoryRun {
    async fn apply_order(&mut self, order: &MirrorOrder) -> Result<RowChanges, MirrorError> {
        self.working.apply(order)
    }

    async fn commit(self: Box<Self>) -> Result<(), MirrorError> {
        let Self { target, working } = *self;
        *target.lock().await = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MirrorError> {
        Ok(())
    }
}

#[async_trait]
impl MirrorStore for MemoryMirror {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn ensure_schema(&self) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn begin_run(&self) -> Result<Box<dyn MirrorRun>, MirrorError> {
        let working = self.state.lock().await.clone();
        Ok(Box::new(MemoryRun {
            target: Arc::clone(&self.state),
            working,
        }))
    }

    async fn load_paint_catalog(&self) -> Result<PaintCatalog, MirrorError> {
        Ok(self.state.lock().await.paint.clone())
    }
}

#[async_trait]
impl MirrorReader for MemoryMirror {
    async fn list_orders(&self, scope: &OrderScope) -> Result<Vec<MirrorOrder>, MirrorError> {
        let state = self.state.lock().await;
        let mut rows = state
            .headers
            .values()
            .filter(|row| scope.filial.is_none() || row.header.filial == scope.filial)
            .filter(|row| scope.admits_status(&row.status_name))
            .filter(|row| match scope.window {
                Some(window) => row
                    .header
                    .date(scope.date_field)
                    .map(|ts| window.contains(ts.date()))
                    .unwrap_or(false),
                None => true,
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            let (da, db) = (a.header.date(scope.date_field), b.header.date(scope.date_field));
            // Some(_) before None, newest first.
            db.is_some()
                .cmp(&da.is_some())
                .then(db.cmp(&da))
                .then(b.header.series.cmp(&a.header.series))
        });
        Ok(rows.into_iter().map(|row| state.assemble(row, false)).collect())
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Option<MirrorOrder>, MirrorError> {
        let state = self.state.lock().await;
        Ok(state
            .headers
            .get(&order_id)
            .map(|row| state.assemble(row, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opmirror_core::{DateField, StageStatus, SyncWindow};

    fn order(id: i64, series: i64, item_ids: &[i64], stage_ids: Option<&[i64]>) -> MirrorOrder {
        let valid_until = NaiveDate::from_ymd_opt(2025, 10, 1 + id as u32)
            .unwrap()
            .and_hms_opt(0, 0, 0);
        let routing = stage_ids.map(|ids| {
            ids.iter()
                .enumerate()
                .map(|(seq, stage)| RoutingStep {
                    order_series: series,
                    stage_id: *stage,
                    sequence: seq as i64 + 1,
                    started_at: None,
                    finished_at: None,
                    status_code: None,
                })
                .collect::<Vec<_>>()
        });
        let stages = routing.as_ref().map(|steps| {
            steps
                .iter()
                .map(|s| StageProgress {
                    key: s.key(),
                    status: StageStatus::Pending,
                    started_at: None,
                    finished_at: None,
                })
                .collect()
        });
        MirrorOrder {
            header: OrderHeader {
                id,
                series,
                filial: Some(1),
                valid_until,
                ..Default::default()
            },
            status_name: "OPEN".into(),
            completion_percent: 0.0,
            resolved_color: "NO PAINT".into(),
            items: item_ids
                .iter()
                .map(|item_id| OrderItem {
                    id: *item_id,
                    order_id: id,
                    ..Default::default()
                })
                .collect(),
            routing,
            stages,
        }
    }

    #[tokio::test]
    async fn nothing_is_visible_before_commit_and_reapplying_is_a_no_op() {
        let mirror = MemoryMirror::new();
        let mut run = mirror.begin_run().await.unwrap();
        let changes = run.apply_order(&order(1, 10, &[1, 2], Some(&[4, 6]))).await.unwrap();
        assert_eq!(changes.total(), 7);
        assert_eq!(mirror.order_count().await, 0);
        run.commit().await.unwrap();
        assert_eq!(mirror.order_count().await, 1);

        let mut run = mirror.begin_run().await.unwrap();
        let again = run.apply_order(&order(1, 10, &[1, 2], Some(&[4, 6]))).await.unwrap();
        assert_eq!(again.total(), 0);
        run.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn vanished_items_and_stages_are_pruned_unless_routing_is_unknown() {
        let mirror = MemoryMirror::new();
        let mut run = mirror.begin_run().await.unwrap();
        run.apply_order(&order(1, 10, &[1, 2], Some(&[4, 6]))).await.unwrap();
        let changes = run.apply_order(&order(1, 10, &[1], None)).await.unwrap();
        assert_eq!(changes.items, 1);
        assert_eq!(changes.routing_steps, 0);
        let changes = run.apply_order(&order(1, 10, &[1], Some(&[4]))).await.unwrap();
        assert_eq!(changes.routing_steps, 1);
        assert_eq!(changes.stage_progress, 1);
        run.commit().await.unwrap();

        let stored = mirror.load_order(1).await.unwrap().unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.stages.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn integrity_violations_leave_the_run_untouched() {
        let mirror = MemoryMirror::new();
        let mut run = mirror.begin_run().await.unwrap();
        run.apply_order(&order(1, 10, &[1], None)).await.unwrap();
        let err = run.apply_order(&order(2, 10, &[5], None)).await.unwrap_err();
        assert!(matches!(err, MirrorError::Integrity { order_id: 2, .. }));

        let mut orphan = order(3, 30, &[7], None);
        orphan.items[0].order_id = 99;
        assert!(run.apply_order(&orphan).await.is_err());
        run.commit().await.unwrap();
        assert_eq!(mirror.order_count().await, 1);
        assert!(mirror.load_order(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_order_keeps_earlier_writes_and_series_index_follows_renumbering() {
        let mirror = MemoryMirror::new();
        let mut run = mirror.begin_run().await.unwrap();
        run.apply_order(&order(1, 10, &[1, 2], Some(&[4]))).await.unwrap();
        assert!(run.apply_order(&order(2, 10, &[5], None)).await.is_err());
        run.apply_order(&order(2, 20, &[5], None)).await.unwrap();

        let renumbered = run.apply_order(&order(1, 11, &[1, 2], None)).await.unwrap();
        assert_eq!(renumbered.headers, 1);
        run.apply_order(&order(3, 10, &[], None)).await.unwrap();
        let err = run.apply_order(&order(4, 11, &[], None)).await.unwrap_err();
        assert!(matches!(err, MirrorError::Integrity { order_id: 4, .. }));
        run.commit().await.unwrap();

        assert_eq!(mirror.order_count().await, 3);
        let first = mirror.load_order(1).await.unwrap().unwrap();
        assert_eq!(first.header.series, 11);
        assert_eq!(first.items.len(), 2);
    }

    #[tokio::test]
    async fn listing_filters_by_window_and_orders_newest_first() {
        let mirror = MemoryMirror::new();
        let mut run = mirror.begin_run().await.unwrap();
        for (id, series) in [(1, 10), (2, 20), (5, 50)] {
            run.apply_order(&order(id, series, &[], None)).await.unwrap();
        }
        run.commit().await.unwrap();

        let scope = OrderScope {
            filial: Some(1),
            date_field: DateField::Validity,
            window: Some(
                SyncWindow::explicit(
                    NaiveDate::from_ymd_opt(2025, 10, 2).unwrap(),
                    NaiveDate::from_ymd_opt(2025, 10, 3).unwrap(),
                )
                .unwrap(),
            ),
            status_names: vec![],
        };
        let ids = mirror
            .list_orders(&scope)
            .await
            .unwrap()
            .iter()
            .map(|o| o.header.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1]);

        let all = mirror.list_orders(&OrderScope::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].stages.is_none());
    }
}
