use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scoap_adapters::load_payload_file;
use scoap_core::ArticleId;
use scoap_storage::{CatalogStore, MemoryCatalog, PgCatalog};
use scoap_sync::{BackfillKind, ImportOptions, Services, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "scoap-cli")]
#[command(about = "SCOAP3 article import and compliance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one JSON record and print the stored article.
    Import {
        path: PathBuf,
        #[arg(long)]
        include_files: bool,
        /// Import into an in-memory catalog instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Evaluate compliance for the given articles.
    Evaluate { article_ids: Vec<ArticleId> },
    /// Force the stored reports of the given articles to compliant.
    MarkCompliant { article_ids: Vec<ArticleId> },
    /// Import every record under a prefix of the records directory.
    Backfill {
        #[arg(long, default_value = "legacy/")]
        prefix: String,
    },
    /// Re-link author affiliations for already imported records under a prefix.
    LinkAffiliations {
        #[arg(long, default_value = "legacy/")]
        prefix: String,
    },
    /// Set the next allocated article id.
    RestartSequence { next_id: ArticleId },
    Migrate,
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "scoap=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect(config: &SyncConfig) -> Result<Arc<dyn CatalogStore>> {
    let catalog = PgCatalog::connect(&config.database_url, DB_MAX_CONNECTIONS)
        .await
        .context("connecting to the catalog database")?;
    Ok(Arc::new(catalog))
}

async fn run_backfill(config: SyncConfig, kind: BackfillKind, prefix: &str) -> Result<()> {
    let store = connect(&config).await?;
    let services = Services::build(config, store)?;
    let plan = services.backfill(kind, prefix).await?;
    services.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Import {
            path,
            include_files,
            dry_run,
        } => {
            let payload = load_payload_file(&path)?;
            let store: Arc<dyn CatalogStore> = if dry_run {
                Arc::new(MemoryCatalog::new())
            } else {
                connect(&config).await?
            };
            let services = Services::build(config, store)?;
            let aggregate = services
                .importer
                .import_payload(&payload, ImportOptions { include_files })
                .await?;
            services.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&aggregate)?);
        }
        Commands::Evaluate { article_ids } => {
            let store = connect(&config).await?;
            let services = Services::build(config, store)?;
            let outcome = services.compliance.evaluate_many(&article_ids).await;
            services.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::MarkCompliant { article_ids } => {
            let store = connect(&config).await?;
            let services = Services::build(config, store)?;
            let marked = services.compliance.mark_compliant(&article_ids).await?;
            services.shutdown().await;
            println!("marked compliant: {marked:?}");
        }
        Commands::Backfill { prefix } => run_backfill(config, BackfillKind::Import, &prefix).await?,
        Commands::LinkAffiliations { prefix } => {
            run_backfill(config, BackfillKind::LinkAffiliations, &prefix).await?
        }
        Commands::RestartSequence { next_id } => {
            let store = connect(&config).await?;
            store.restart_article_sequence(next_id).await?;
            println!("article sequence restarted at {next_id}");
        }
        Commands::Migrate => {
            let catalog = PgCatalog::connect(&config.database_url, DB_MAX_CONNECTIONS).await?;
            catalog.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let store = connect(&config).await?;
            let services = Services::build(config, store)?;
            let state = scoap_web::AppState::new(
                services.store.clone(),
                services.importer.clone(),
                services.compliance.clone(),
            );
            scoap_web::serve(state, port).await?;
            services.shutdown().await;
        }
    }

    Ok(())
}
