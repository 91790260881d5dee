use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use opmirror_core::DateField;
use opmirror_source::{OrderReader, SchemaRules};
use opmirror_storage::{MirrorStore, PgMirror};
use opmirror_sync::{SyncConfig, SyncPipeline, SyncRequest, SyncRunSummary, WindowSpec, DEFAULT_STATUSES};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "opmirror")]
#[command(about = "Mirror legacy production orders into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass
    Sync(SyncArgs),
    /// Print the routing schema and lookup columns discovered in the source
    Probe,
    /// Create the mirror tables when missing
    Migrate,
    /// Start the read-only query API
    Serve,
    /// Run the cron syncs until Ctrl-C
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Site code; defaults to OPMIRROR_FILIAL
    #[arg(long)]
    filial: Option<i64>,
    /// validity, planned-start or issue
    #[arg(long, default_value = "validity")]
    date_field: DateField,
    /// Legacy status codes, comma separated
    #[arg(long = "status", value_delimiter = ',')]
    statuses: Vec<String>,
    /// Sync every status instead of the open ones
    #[arg(long, conflicts_with = "statuses")]
    all_statuses: bool,
    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
    #[arg(long, conflicts_with = "from")]
    days_back: Option<i64>,
    #[arg(long, conflicts_with = "from")]
    days_ahead: Option<i64>,
    #[arg(long)]
    limit: Option<usize>,
    /// Select, fetch and derive without writing to the mirror
    #[arg(long)]
    dry_run: bool,
}

impl SyncArgs {
    fn into_request(self, config: &SyncConfig) -> SyncRequest {
        let window = match (self.from, self.to) {
            (Some(from), Some(to)) => WindowSpec::Explicit { from, to },
            _ => WindowSpec::Relative {
                days_back: self.days_back.unwrap_or(7),
                days_ahead: self.days_ahead.unwrap_or(30),
            },
        };
        let statuses = if self.all_statuses {
            Vec::new()
        } else if self.statuses.is_empty() {
            DEFAULT_STATUSES.iter().map(|s| s.to_string()).collect()
        } else {
            self.statuses
        };
        SyncRequest {
            filial: self.filial.unwrap_or(config.filial),
            date_field: self.date_field,
            window,
            statuses,
            limit: self.limit,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let request = args.into_request(&config);
            let summary = opmirror_sync::run_sync_once_from_env(&request).await?;
            print_summary(&summary);
        }
        Commands::Probe => {
            let source = opmirror_sync::open_source(&config).await?;
            let rules = SchemaRules::load_or_builtin(&config.rules_dir)?;
            let reader = OrderReader::prepare(source, &rules)
                .await
                .context("probing legacy schema")?;
            let report = serde_json::json!({
                "routing": reader.routing_schema(),
                "routing_warning": reader.routing_warning(),
                "lookups": reader.lookups(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing probe report")?
            );
        }
        Commands::Migrate => {
            let mirror = PgMirror::connect(&config.database_url)
                .await
                .context("connecting to the mirror database")?;
            mirror
                .ensure_schema()
                .await
                .context("ensuring mirror schema")?;
            println!("mirror schema ready");
        }
        Commands::Serve => {
            opmirror_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} dry_run={} selected={} succeeded={} failed={} rows_changed={} reports={}",
        summary.run_id,
        summary.dry_run,
        summary.selected,
        summary.succeeded,
        summary.failed,
        summary.rows_changed.total(),
        summary.reports_dir
    );
    match (&summary.routing_table, &summary.routing_warning) {
        (Some(table), _) => println!("routing table: {table}"),
        (None, Some(warning)) => println!("routing skipped: {warning}"),
        (None, None) => {}
    }
    for failure in &summary.failures {
        println!("  order {} failed: {}", failure.order_id, failure.error);
    }
}
