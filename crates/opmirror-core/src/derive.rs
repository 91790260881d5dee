//! Derivation rules shared by every consumer of the mirror.
//!
//! `resolve_color` and `completion_percent` are the only places these fields are computed.
//! The sync writes their output and the query API re-runs `resolve_color` whenever it
//! needs the color of a stored order, so both always agree.

use std::collections::BTreeSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::stage::{classify_stage, StageCodeTable};
use crate::{
    order_status_name, MirrorOrder, OrderHeader, OrderItem, PaintCatalog, RoutingStep,
    StageProgress,
};

/// Color sentinel used when no tier yields a color.
pub const NO_PAINT: &str = "NO PAINT";

/// Stored values that mean "no color" rather than an actual color.
const ABSENT_COLOR_MARKERS: [&str; 2] = [NO_PAINT, "SEM PINTURA"];

pub fn is_absent_color(text: Option<&str>) -> bool {
    match text.map(str::trim) {
        None | Some("") => true,
        Some(value) => ABSENT_COLOR_MARKERS
            .iter()
            .any(|marker| value.eq_ignore_ascii_case(marker)),
    }
}

/// Case- and accent-folded key, so "azul" sorts before "Verde" and "Âmbar" before "Branco".
fn collation_key(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Trim, drop blanks, dedupe, sort alphabetically, join with ", ".
pub fn join_distinct<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let distinct = values
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>();
    if distinct.is_empty() {
        return None;
    }
    let mut sorted = distinct
        .into_iter()
        .map(|v| (collation_key(v), v))
        .collect::<Vec<_>>();
    sorted.sort();
    Some(
        sorted
            .into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Four-tier color fallback: header text, item colors, configured paint notes, sentinel.
pub fn resolve_color<'a>(
    header_color: Option<&str>,
    item_colors: impl IntoIterator<Item = &'a str>,
    paint_observations: impl IntoIterator<Item = &'a str>,
) -> String {
    if !is_absent_color(header_color) {
        if let Some(text) = header_color {
            return text.trim().to_string();
        }
    }
    join_distinct(item_colors)
        .or_else(|| join_distinct(paint_observations))
        .unwrap_or_else(|| NO_PAINT.to_string())
}

pub fn resolve_order_color(
    header_color: Option<&str>,
    items: &[OrderItem],
    paint: &PaintCatalog,
) -> String {
    resolve_color(
        header_color,
        items.iter().filter_map(|item| item.color_name.as_deref()),
        paint.observations_for(items.iter().filter_map(|item| item.product_code)),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuantityTotals {
    pub planned: f64,
    pub produced: f64,
    pub remaining: f64,
}

impl QuantityTotals {
    /// Sum of item quantities, or `None` when no item carries any quantity.
    pub fn from_items(items: &[OrderItem]) -> Option<Self> {
        if !items.iter().any(OrderItem::has_quantities) {
            return None;
        }
        Some(items.iter().fold(Self::default(), |acc, item| Self {
            planned: acc.planned + item.planned_qty.unwrap_or(0.0),
            produced: acc.produced + item.produced_qty.unwrap_or(0.0),
            remaining: acc.remaining + item.remaining_qty.unwrap_or(0.0),
        }))
    }

    pub fn from_header(header: &OrderHeader) -> Self {
        Self {
            planned: header.planned_qty.unwrap_or(0.0),
            produced: header.produced_qty.unwrap_or(0.0),
            remaining: header.remaining_qty.unwrap_or(0.0),
        }
    }

    pub fn percent(&self) -> f64 {
        if self.planned > 0.0 {
            round2((1.0 - self.remaining / self.planned) * 100.0)
        } else {
            0.0
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Completion percentage, preferring item totals over the header's own totals.
pub fn completion_percent(header: &OrderHeader, items: &[OrderItem]) -> f64 {
    QuantityTotals::from_items(items)
        .unwrap_or_else(|| QuantityTotals::from_header(header))
        .percent()
}

pub fn classify_steps(steps: &[RoutingStep], codes: &StageCodeTable) -> Vec<StageProgress> {
    steps
        .iter()
        .map(|step| StageProgress {
            key: step.key(),
            status: classify_stage(
                step.started_at,
                step.finished_at,
                step.status_code.as_deref(),
                codes,
            ),
            started_at: step.started_at,
            finished_at: step.finished_at,
        })
        .collect()
}

/// Builds the mirror representation of one order from source truth.
pub fn derive_order(
    header: OrderHeader,
    items: Vec<OrderItem>,
    routing: Option<Vec<RoutingStep>>,
    paint: &PaintCatalog,
    codes: &StageCodeTable,
) -> MirrorOrder {
    let completion_percent = completion_percent(&header, &items);
    let resolved_color = resolve_order_color(header.color_text.as_deref(), &items, paint);
    let status_name = order_status_name(header.status_code.as_deref()).to_string();
    let stages = routing.as_deref().map(|steps| classify_steps(steps, codes));
    MirrorOrder {
        header,
        status_name,
        completion_percent,
        resolved_color,
        items,
        routing,
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StageStatus;
    use chrono::NaiveDate;

    fn item(id: i64, planned: Option<f64>, remaining: Option<f64>) -> OrderItem {
        OrderItem {
            id,
            order_id: 1,
            planned_qty: planned,
            remaining_qty: remaining,
            ..Default::default()
        }
    }

    fn colored(id: i64, product: i64, color: Option<&str>) -> OrderItem {
        OrderItem {
            id,
            order_id: 1,
            product_code: Some(product),
            color_name: color.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn percent_prefers_item_sums_over_header_totals() {
        let header = OrderHeader {
            planned_qty: Some(100.0),
            remaining_qty: Some(100.0),
            ..Default::default()
        };
        let items = vec![item(1, Some(10.0), Some(2.0)), item(2, Some(30.0), Some(13.0))];
        // 1 - 15/40 = 0.625
        assert_eq!(completion_percent(&header, &items), 62.5);
    }

    #[test]
    fn percent_falls_back_to_header_when_items_carry_no_quantities() {
        let header = OrderHeader {
            planned_qty: Some(3.0),
            remaining_qty: Some(1.0),
            ..Default::default()
        };
        let items = vec![item(1, None, None)];
        assert_eq!(completion_percent(&header, &items), 66.67);
        assert_eq!(completion_percent(&header, &[]), 66.67);
    }

    #[test]
    fn percent_is_zero_when_nothing_is_planned() {
        let header = OrderHeader::default();
        assert_eq!(completion_percent(&header, &[item(1, Some(0.0), Some(0.0))]), 0.0);
        assert_eq!(completion_percent(&header, &[]), 0.0);
    }

    #[test]
    fn null_item_quantities_count_as_zero_once_any_item_has_data() {
        let items = vec![item(1, Some(8.0), None), item(2, None, Some(2.0))];
        assert_eq!(completion_percent(&OrderHeader::default(), &items), 75.0);
    }

    #[test]
    fn header_color_wins_unless_absent() {
        let paint = PaintCatalog::default();
        let items = vec![colored(1, 5, Some("Verde"))];
        assert_eq!(resolve_order_color(Some(" Branco "), &items, &paint), "Branco");
        assert_eq!(resolve_order_color(Some("sem pintura"), &items, &paint), "Verde");
        assert_eq!(resolve_order_color(Some(" No Paint "), &items, &paint), "Verde");
        assert_eq!(resolve_order_color(Some("   "), &items, &paint), "Verde");
    }

    #[test]
    fn item_colors_are_deduped_and_sorted() {
        let items = vec![
            colored(1, 5, Some("Verde")),
            colored(2, 5, Some("Azul")),
            colored(3, 6, Some(" Verde")),
            colored(4, 6, Some("")),
            colored(5, 6, None),
        ];
        let resolved = resolve_order_color(Some(""), &items, &PaintCatalog::default());
        assert_eq!(resolved, "Azul, Verde");
    }

    #[test]
    fn item_colors_sort_ignoring_case_and_accents() {
        assert_eq!(resolve_color(Some(""), ["Verde", "azul"], []), "azul, Verde");
        assert_eq!(
            join_distinct(["Verde", "Âmbar", "Branco"]).as_deref(),
            Some("Âmbar, Branco, Verde")
        );
        assert_eq!(
            join_distinct(["Ébano", "escuro", "Azul", "Escuro"]).as_deref(),
            Some("Azul, Ébano, Escuro, escuro")
        );
    }

    #[test]
    fn paint_observations_apply_when_items_have_no_color() {
        let paint = PaintCatalog::from_entries([(7, "Epóxi Cinza".to_string())]);
        let items = vec![colored(1, 7, None), colored(2, 8, Some("  "))];
        assert_eq!(resolve_order_color(None, &items, &paint), "Epóxi Cinza");
    }

    #[test]
    fn sentinel_when_every_tier_is_empty() {
        let items = vec![colored(1, 9, None)];
        assert_eq!(
            resolve_order_color(Some("SEM PINTURA"), &items, &PaintCatalog::default()),
            NO_PAINT
        );
    }

    #[test]
    fn derive_order_fills_every_derived_field() {
        let header = OrderHeader {
            id: 10,
            series: 500,
            status_code: Some("IN".into()),
            ..Default::default()
        };
        let started = NaiveDate::from_ymd_opt(2025, 10, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap();
        let routing = vec![RoutingStep {
            order_series: 500,
            stage_id: 4,
            sequence: 1,
            started_at: Some(started),
            finished_at: None,
            status_code: None,
        }];
        let order = derive_order(
            header,
            vec![item(1, Some(4.0), Some(1.0))],
            Some(routing),
            &PaintCatalog::default(),
            &StageCodeTable::default(),
        );
        assert_eq!(order.status_name, "STARTED");
        assert_eq!(order.completion_percent, 75.0);
        assert_eq!(order.resolved_color, NO_PAINT);
        let stages = order.stages.unwrap();
        assert_eq!(stages[0].status, StageStatus::InProgress);
        assert_eq!(stages[0].key.order_series, 500);
    }
}
