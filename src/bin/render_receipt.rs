use anyhow::{bail, Context, Result};
use clap::Parser;
use receipt_sync::catalog::CatalogClient;
use receipt_sync::config;
use receipt_sync::markup::Interpreter;
use receipt_sync::model::{PrintOperation, ReceiptBody};
use receipt_sync::store::ReceiptStore;
use receipt_sync::transport::{HttpFetcher, RetryPolicy, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Show the print operations a receipt turns into, without printing it"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Receipt id to fetch from the API
    #[arg(long, conflicts_with = "file")]
    id: Option<String>,

    /// Local file holding a receipt body
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let fetcher = HttpFetcher::new(Duration::from_secs(30)).context("failed to build HTTP client")?;
    let transport = Transport::new(Arc::new(fetcher), RetryPolicy::new(cfg.api.max_attempts));
    let catalog = CatalogClient::new(transport, cfg.base_url()?, cfg.api.pos_id.clone());
    let store = ReceiptStore::open(cfg.data_dir()).await?;

    let body = match (&args.id, &args.file) {
        (Some(id), None) => catalog.fetch_detail(id).await?,
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            ReceiptBody::from_text(&text.replace("\r\n", "\n").replace('\n', "\r\n"))
        }
        _ => bail!("pass exactly one of --id or --file"),
    };

    let interpretation = Interpreter::new(catalog, store).interpret(&body).await?;
    for (i, op) in interpretation.operations.iter().enumerate() {
        match op {
            PrintOperation::EmitText { content, style } => println!(
                "{:>3} text  bold={} height={} align={:?} {:?}",
                i + 1,
                style.bold,
                style.height_unit,
                style.align,
                content
            ),
            PrintOperation::EmitImage { image, source } => println!(
                "{:>3} image source={} {}x{}",
                i + 1,
                source.as_str(),
                image.width(),
                image.height()
            ),
            PrintOperation::Cut => println!("{:>3} cut", i + 1),
        }
    }
    for warning in &interpretation.warnings {
        println!("warning: {}", warning);
    }
    Ok(())
}
