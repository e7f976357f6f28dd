use anyhow::{Context, Result};
use clap::Parser;
use receipt_sync::catalog::CatalogClient;
use receipt_sync::config;
use receipt_sync::cycle::{Pipeline, Runner};
use receipt_sync::events::{StatusSink, TracingSink};
use receipt_sync::printer::{EscPosPrinter, LogPrinter, Printer};
use receipt_sync::store::ReceiptStore;
use receipt_sync::transport::{HttpFetcher, RetryPolicy, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(author, version, about = "Poll pending receipts and send them to the receipt printer")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Log print operations instead of writing to the printer
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let fetcher = HttpFetcher::new(HTTP_TIMEOUT).context("failed to build HTTP client")?;
    let transport = Transport::new(Arc::new(fetcher), RetryPolicy::new(cfg.api.max_attempts));
    let catalog = CatalogClient::new(transport, cfg.base_url()?, cfg.api.pos_id.clone());
    let store = ReceiptStore::open(cfg.data_dir())
        .await
        .context("failed to open receipt store")?;

    let printer: Arc<dyn Printer> = if args.dry_run {
        Arc::new(LogPrinter)
    } else {
        Arc::new(EscPosPrinter::from_config(&cfg)?)
    };
    let events: Arc<dyn StatusSink> = Arc::new(TracingSink);
    let pipeline = Pipeline::new(catalog, store, printer, events.clone(), cfg.app.retention_days);

    info!(
        pos_id = %cfg.api.pos_id,
        base_url = %cfg.api.base_url,
        interval_secs = cfg.app.poll_interval_seconds,
        dry_run = args.dry_run,
        "starting receipt sync"
    );

    if args.once {
        let report = pipeline.run_cycle().await?;
        info!(
            listed = report.listed,
            printed = report.printed.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            swept = report.swept.len(),
            "single cycle finished"
        );
        return Ok(());
    }

    let runner = Runner::new(pipeline, events, cfg.poll_interval(), cfg.restart_after());
    runner.run().await?;
    Ok(())
}
