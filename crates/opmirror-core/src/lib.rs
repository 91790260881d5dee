//! Core domain model for the production-order mirror.

pub mod derive;
pub mod paint;
pub mod stage;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use derive::{
    completion_percent, derive_order, resolve_color, resolve_order_color, QuantityTotals, NO_PAINT,
};
pub use paint::{paint_totals, PaintBalance, PAINT_DESCRIPTION_MARKERS};
pub use stage::{classify_stage, StageCodeTable, StageStatus};

pub const CRATE_NAME: &str = "opmirror-core";

/// Legacy primary key of a production order.
pub type OrderId = i64;
/// Legacy "series" number, the key most downstream tables link on.
pub type OrderSeries = i64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("window start {from} is after window end {to}")]
    InvertedWindow { from: NaiveDate, to: NaiveDate },
    #[error("unknown date field `{0}` (expected issue, planned-start or validity)")]
    UnknownDateField(String),
}

/// Which header date the sync window is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateField {
    Issue,
    PlannedStart,
    #[default]
    Validity,
}

impl DateField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::PlannedStart => "planned-start",
            Self::Validity => "validity",
        }
    }
}

impl fmt::Display for DateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateField {
    type Err = DomainError;

    // Legacy operators still type the original field names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "issue" | "emissao" => Ok(Self::Issue),
            "planned-start" | "prev-inicio" => Ok(Self::PlannedStart),
            "validity" | "validade" => Ok(Self::Validity),
            other => Err(DomainError::UnknownDateField(other.to_string())),
        }
    }
}

/// Inclusive date range on one of the header dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl SyncWindow {
    pub fn explicit(from: NaiveDate, to: NaiveDate) -> Result<Self, DomainError> {
        if from > to {
            return Err(DomainError::InvertedWindow { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn relative(today: NaiveDate, days_back: i64, days_ahead: i64) -> Result<Self, DomainError> {
        Self::explicit(
            today - Duration::days(days_back),
            today + Duration::days(days_ahead),
        )
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Humanized name for the legacy two-letter order status code.
pub fn order_status_name(code: Option<&str>) -> &'static str {
    match code.unwrap_or_default().trim().to_ascii_uppercase().as_str() {
        "AA" => "OPEN",
        "IN" => "STARTED",
        "EP" | "SS" => "PARTIAL_ENTRY",
        "FF" => "FINISHED",
        "CC" => "CANCELLED",
        _ => "OTHER",
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderHeader {
    pub id: OrderId,
    pub series: OrderSeries,
    pub filial: Option<i64>,
    pub description: Option<String>,
    pub sales_order: Option<i64>,
    pub status_code: Option<String>,
    pub issued_at: Option<NaiveDateTime>,
    pub planned_start_at: Option<NaiveDateTime>,
    pub valid_until: Option<NaiveDateTime>,
    pub planned_qty: Option<f64>,
    pub produced_qty: Option<f64>,
    pub remaining_qty: Option<f64>,
    /// Explicit color text carried by the header itself, when the installation has one.
    pub color_text: Option<String>,
}

impl OrderHeader {
    pub fn date(&self, field: DateField) -> Option<NaiveDateTime> {
        match field {
            DateField::Issue => self.issued_at,
            DateField::PlannedStart => self.planned_start_at,
            DateField::Validity => self.valid_until,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: OrderId,
    pub order_series: Option<OrderSeries>,
    pub lot: Option<i64>,
    pub product_code: Option<i64>,
    pub product_description: Option<String>,
    pub color_code: Option<i64>,
    pub color_name: Option<String>,
    pub planned_qty: Option<f64>,
    pub produced_qty: Option<f64>,
    pub remaining_qty: Option<f64>,
}

impl OrderItem {
    pub fn has_quantities(&self) -> bool {
        self.planned_qty.is_some() || self.produced_qty.is_some() || self.remaining_qty.is_some()
    }
}

/// Natural key shared by `routing_step` and `stage_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageKey {
    pub order_series: OrderSeries,
    pub stage_id: i64,
    pub sequence: i64,
}

/// Raw routing step as read from whichever legacy table carries routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingStep {
    pub order_series: OrderSeries,
    pub stage_id: i64,
    pub sequence: i64,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub status_code: Option<String>,
}

impl RoutingStep {
    pub fn key(&self) -> StageKey {
        StageKey {
            order_series: self.order_series,
            stage_id: self.stage_id,
            sequence: self.sequence,
        }
    }
}

/// Classified state of one routing step, as stored in the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub key: StageKey,
    pub status: StageStatus,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

/// Everything the mirror stores for one order after derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorOrder {
    pub header: OrderHeader,
    pub status_name: String,
    pub completion_percent: f64,
    pub resolved_color: String,
    pub items: Vec<OrderItem>,
    /// `None` when routing could not be discovered for the run; existing rows stay untouched.
    pub routing: Option<Vec<RoutingStep>>,
    /// Classified `routing`, same presence and order.
    pub stages: Option<Vec<StageProgress>>,
}

/// Product code -> paint observation, the configured last-but-one color fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaintCatalog {
    entries: BTreeMap<i64, String>,
}

impl PaintCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (i64, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, product_code: i64, observation: impl Into<String>) {
        self.entries.insert(product_code, observation.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn observation(&self, product_code: i64) -> Option<&str> {
        self.entries.get(&product_code).map(String::as_str)
    }

    pub fn observations(&self) -> impl Iterator<Item = (i64, &str)> + '_ {
        self.entries.iter().map(|(code, note)| (*code, note.as_str()))
    }

    pub fn is_paint_product(&self, product_code: i64) -> bool {
        self.entries.contains_key(&product_code)
    }

    pub fn observations_for(&self, product_codes: impl IntoIterator<Item = i64>) -> Vec<&str> {
        product_codes
            .into_iter()
            .filter_map(|code| self.observation(code))
            .collect()
    }
}
