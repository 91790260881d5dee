//! Per-run report directory: JSON summary, markdown brief and parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDateTime;
use opmirror_core::MirrorOrder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::SyncRunSummary;

pub const SUMMARY_FILE: &str = "sync_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Where a run's artifacts land, fixed before the run writes anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub run_dir: PathBuf,
    pub manifest: PathBuf,
}

impl ReportPaths {
    pub fn for_run(reports_root: &Path, run_id: &str) -> Self {
        let run_dir = reports_root.join(run_id);
        let manifest = run_dir.join(SNAPSHOTS_DIR).join(MANIFEST_FILE);
        Self { run_dir, manifest }
    }
}

pub async fn write_reports(
    paths: &ReportPaths,
    summary: &SyncRunSummary,
    orders: &[MirrorOrder],
) -> Result<()> {
    fs::create_dir_all(&paths.run_dir)
        .await
        .with_context(|| format!("creating {}", paths.run_dir.display()))?;

    export_parquet_snapshots(paths, orders).await?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(paths.run_dir.join(SUMMARY_FILE), summary_json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(paths.run_dir.join(BRIEF_FILE), run_brief_markdown(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(())
}

pub fn run_brief_markdown(summary: &SyncRunSummary) -> String {
    let mode = if summary.dry_run { "dry run" } else { "committed" };
    let routing = match (&summary.routing_table, &summary.routing_warning) {
        (Some(table), _) => format!("`{table}`"),
        (None, Some(warning)) => format!("skipped ({warning})"),
        (None, None) => "skipped".to_string(),
    };
    let failures = if summary.failures.is_empty() {
        "- none".to_string()
    } else {
        summary
            .failures
            .iter()
            .map(|f| format!("- order {}: {}", f.order_id, f.error))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let changes = &summary.rows_changed;

    format!(
        "# Order Mirror Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Mode: {}\n- Source: {}\n- Mirror: {}\n- Filial: {}\n- Window: {} on {}\n- Statuses: {}\n- Routing: {}\n- Paint catalog: {}\n\n## Orders\n- Selected: {}\n- Succeeded: {}\n- Failed: {}\n\n## Rows Changed\n- order_header: {}\n- order_item: {}\n- routing_step: {}\n- stage_progress: {}\n\n## Failures\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        mode,
        summary.source,
        summary.mirror,
        summary.filial,
        summary.window,
        summary.date_field,
        if summary.statuses.is_empty() {
            "all".to_string()
        } else {
            summary.statuses.join(", ")
        },
        routing,
        summary.paint_catalog,
        summary.selected,
        summary.succeeded,
        summary.failed,
        changes.headers,
        changes.items,
        changes.routing_steps,
        changes.stage_progress,
        failures,
    )
}

async fn export_parquet_snapshots(paths: &ReportPaths, orders: &[MirrorOrder]) -> Result<()> {
    let snapshot_dir = paths.run_dir.join(SNAPSHOTS_DIR);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let orders_path = snapshot_dir.join("orders.parquet");
    let stages_path = snapshot_dir.join("stage_progress.parquet");
    write_orders_parquet(&orders_path, orders)?;
    write_stage_progress_parquet(&stages_path, orders)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("orders", &paths.run_dir, &orders_path)?,
            manifest_entry("stage_progress", &paths.run_dir, &stages_path)?,
        ],
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&paths.manifest, bytes)
        .await
        .with_context(|| format!("writing {}", paths.manifest.display()))?;
    Ok(())
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn timestamp_text(value: Option<NaiveDateTime>) -> Option<String> {
    value.map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn write_orders_parquet(path: &Path, orders: &[MirrorOrder]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("order_id", DataType::Int64, false),
        ArrowField::new("order_series", DataType::Int64, false),
        ArrowField::new("filial", DataType::Int64, true),
        ArrowField::new("status_code", DataType::Utf8, true),
        ArrowField::new("status_name", DataType::Utf8, false),
        ArrowField::new("valid_until", DataType::Utf8, true),
        ArrowField::new("completion_percent", DataType::Float64, false),
        ArrowField::new("resolved_color", DataType::Utf8, false),
        ArrowField::new("item_count", DataType::UInt32, false),
    ]));

    let valid_until = orders
        .iter()
        .map(|o| timestamp_text(o.header.valid_until))
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                orders.iter().map(|o| o.header.id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                orders.iter().map(|o| o.header.series).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                orders.iter().map(|o| o.header.filial).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                orders
                    .iter()
                    .map(|o| o.header.status_code.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                orders
                    .iter()
                    .map(|o| Some(o.status_name.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                valid_until.iter().map(|v| v.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                orders.iter().map(|o| o.completion_percent).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                orders
                    .iter()
                    .map(|o| Some(o.resolved_color.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                orders.iter().map(|o| o.items.len() as u32).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building orders record batch")?;
    write_parquet(path, batch)
}

fn write_stage_progress_parquet(path: &Path, orders: &[MirrorOrder]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("order_series", DataType::Int64, false),
        ArrowField::new("stage_id", DataType::Int64, false),
        ArrowField::new("sequence", DataType::Int64, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("started_at", DataType::Utf8, true),
        ArrowField::new("finished_at", DataType::Utf8, true),
    ]));

    let stages = orders
        .iter()
        .filter_map(|o| o.stages.as_deref())
        .flatten()
        .collect::<Vec<_>>();
    let started = stages
        .iter()
        .map(|s| timestamp_text(s.started_at))
        .collect::<Vec<_>>();
    let finished = stages
        .iter()
        .map(|s| timestamp_text(s.finished_at))
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                stages.iter().map(|s| s.key.order_series).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                stages.iter().map(|s| s.key.stage_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                stages.iter().map(|s| s.key.sequence).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                stages
                    .iter()
                    .map(|s| Some(s.status.as_str()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                started.iter().map(|v| v.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                finished.iter().map(|v| v.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building stage_progress record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
