mod api;
mod config;
mod intake;
mod invoice;
mod invoice_db;
mod llm_client;
mod page_cache;
mod pdf_text;
mod prompts;
mod uploads;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use invoice_db::InvoiceStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser)]
#[command(version, about = "Upload PDF invoices, extract GST fields through an LLM, store and review them")]
struct Cli {
    /// TOML config file; defaults apply when it does not exist
    #[arg(long, env = "INVOICE_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Run a single PDF through the pipeline and print the stored record
    Process { pdf: PathBuf },
    /// Print database statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    install_crypto_provider();

    let cli = Cli::parse();
    let cfg = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = InvoiceStore::new(&cfg.db_path)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg, db).await,
        Command::Process { pdf } => process_one(&cfg, db, &pdf).await,
        Command::Stats => {
            let counts = db.get_counts()?;
            info!(
                uploaded_files = counts.uploaded_files,
                invoices = counts.invoices,
                duplicate_hashes = counts.duplicate_hashes,
                "Database statistics"
            );
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
    }
}

/// Install the ring crypto provider for reqwest's rustls. Returns false
/// when a provider was already in place.
fn install_crypto_provider() -> bool {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed, keeping it");
        return false;
    }
    true
}

async fn serve(cfg: Config, db: InvoiceStore) -> anyhow::Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let counts = db.get_counts()?;
    info!(
        db_path = %cfg.db_path,
        invoices = counts.invoices,
        uploaded_files = counts.uploaded_files,
        "Database ready"
    );

    let upload_dir = PathBuf::from(&cfg.upload_dir);
    std::fs::create_dir_all(&upload_dir)
        .with_context(|| format!("creating upload dir {}", upload_dir.display()))?;

    let model: Arc<dyn llm_client::InvoiceModel> = Arc::from(llm_client::build_model(&cfg.llm)?);
    let state = api::AppState::new(
        db,
        model,
        upload_dir,
        Duration::from_secs(cfg.cache_ttl_secs),
    );
    let app = api::build_router(state, cfg.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    info!("listening on http://{}", cfg.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn process_one(cfg: &Config, db: InvoiceStore, pdf: &Path) -> anyhow::Result<()> {
    let model = llm_client::build_model(&cfg.llm)?;
    let store = Mutex::new(db);

    let file_name = pdf
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let upload = store
        .lock()
        .map_err(|_| anyhow::anyhow!("database lock poisoned"))?
        .insert_uploaded_file(&file_name, &pdf.to_string_lossy())?;

    let stored = intake::process_upload(model.as_ref(), &store, &upload).await?;
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}
