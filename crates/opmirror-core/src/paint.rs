//! Paint items and the paint-pending queue.
//!
//! An item is paint when its product is in the paint catalog. The queue also accepts
//! items whose description names a coating, since most sites never fill the catalog in.

use crate::derive::QuantityTotals;
use crate::{OrderItem, PaintCatalog};

/// Upper-case fragments of product descriptions that denote a coating.
pub const PAINT_DESCRIPTION_MARKERS: [&str; 7] =
    ["TINTA", "PINT", "EPOX", "PRIMER", "ELETRO", "PU", "ESMALTE"];

impl PaintCatalog {
    /// Catalog membership, falling back to the description markers.
    pub fn is_paint_item(&self, item: &OrderItem) -> bool {
        if item.product_code.is_some_and(|code| self.is_paint_product(code)) {
            return true;
        }
        item.product_description.as_deref().is_some_and(|desc| {
            let desc = desc.to_uppercase();
            PAINT_DESCRIPTION_MARKERS
                .iter()
                .any(|marker| desc.contains(marker))
        })
    }
}

/// Paint square meters of an order: items whose product is in the catalog.
pub fn paint_totals(items: &[OrderItem], paint: &PaintCatalog) -> QuantityTotals {
    sum_quantities(items.iter().filter(|item| {
        item.product_code
            .is_some_and(|code| paint.is_paint_product(code))
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PaintBalance {
    pub paint_items: usize,
    pub other_items: usize,
    pub paint: QuantityTotals,
    pub other_remaining: f64,
}

impl PaintBalance {
    pub fn of(items: &[OrderItem], paint: &PaintCatalog) -> Self {
        let (paint_items, other_items): (Vec<&OrderItem>, Vec<&OrderItem>) =
            items.iter().partition(|item| paint.is_paint_item(item));
        Self {
            paint_items: paint_items.len(),
            other_items: other_items.len(),
            paint: sum_quantities(paint_items.into_iter()),
            other_remaining: other_items
                .iter()
                .map(|item| item.remaining_qty.unwrap_or(0.0))
                .sum(),
        }
    }

    /// Everything but paint is finished and paint still has balance.
    pub fn awaiting_paint_only(&self) -> bool {
        self.paint_items > 0 && self.other_remaining == 0.0 && self.paint.remaining > 0.0
    }
}

fn sum_quantities<'a>(items: impl Iterator<Item = &'a OrderItem>) -> QuantityTotals {
    items.fold(QuantityTotals::default(), |acc, item| QuantityTotals {
        planned: acc.planned + item.planned_qty.unwrap_or(0.0),
        produced: acc.produced + item.produced_qty.unwrap_or(0.0),
        remaining: acc.remaining + item.remaining_qty.unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product: i64, desc: &str, planned: f64, remaining: Option<f64>) -> OrderItem {
        OrderItem {
            product_code: Some(product),
            product_description: Some(desc.to_string()),
            planned_qty: Some(planned),
            produced_qty: remaining.map(|r| planned - r),
            remaining_qty: remaining,
            ..Default::default()
        }
    }

    fn catalog() -> PaintCatalog {
        PaintCatalog::from_entries([(300, "Epóxi Cinza".to_string())])
    }

    #[test]
    fn paint_items_come_from_catalog_or_description() {
        let paint = catalog();
        assert!(paint.is_paint_item(&item(300, "Servico", 1.0, None)));
        assert!(paint.is_paint_item(&item(400, "tinta eletrostatica", 1.0, None)));
        assert!(!paint.is_paint_item(&item(100, "Chapa galvanizada", 1.0, None)));
        assert!(!paint.is_paint_item(&OrderItem::default()));
    }

    #[test]
    fn paint_totals_only_count_catalog_products() {
        let items = vec![
            item(300, "Servico", 12.5, Some(2.5)),
            item(400, "Tinta", 4.0, Some(4.0)),
            item(100, "Chapa", 10.0, Some(0.0)),
        ];
        let totals = paint_totals(&items, &catalog());
        assert_eq!(totals.planned, 12.5);
        assert_eq!(totals.produced, 10.0);
        assert_eq!(totals.remaining, 2.5);
    }

    #[test]
    fn awaiting_paint_only_needs_finished_other_items_and_open_paint() {
        let paint = catalog();
        let waiting = vec![item(100, "Chapa", 10.0, Some(0.0)), item(300, "Servico", 5.0, Some(5.0))];
        assert!(PaintBalance::of(&waiting, &paint).awaiting_paint_only());

        let still_cutting = vec![item(100, "Chapa", 10.0, Some(1.0)), item(300, "Servico", 5.0, Some(5.0))];
        assert!(!PaintBalance::of(&still_cutting, &paint).awaiting_paint_only());

        let painted = vec![item(100, "Chapa", 10.0, None), item(300, "Servico", 5.0, Some(0.0))];
        assert!(!PaintBalance::of(&painted, &paint).awaiting_paint_only());

        let no_paint = vec![item(100, "Chapa", 10.0, Some(0.0))];
        let balance = PaintBalance::of(&no_paint, &paint);
        assert_eq!(balance.paint_items, 0);
        assert!(!balance.awaiting_paint_only());
    }
}
