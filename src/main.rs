//! Attachment Upload CLI
//!
//! Inspects and maintains the persisted upload records that let interrupted
//! uploads resume. Uploads themselves are driven by the host application
//! through the library.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attachment_upload::db::{self, SqliteUploadRecordStore, UploadRecordStore};
use attachment_upload::{Config, UploadTier};

#[derive(Parser)]
#[command(name = "attachment-upload", version, about = "Manage resumable attachment upload records")]
struct Cli {
    /// SQLite database holding the upload records
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or clean up persisted upload records
    Records {
        #[command(subcommand)]
        action: RecordsCommand,
    },
}

#[derive(Subcommand)]
enum RecordsCommand {
    /// List in-progress upload records
    List,
    /// Delete the record for one attachment and tier
    Delete { attachment_id: String, tier: String },
    /// Delete records that have used up their attempts
    PurgeExhausted {
        /// Attempt ceiling (defaults to the configured maximum)
        #[arg(long)]
        max: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "attachment_upload=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::debug!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });
    let mut database = config.database;
    if let Some(url) = cli.database_url {
        database.url = url;
    }

    let pool = db::create_pool(&database)
        .await
        .with_context(|| format!("Failed to open database at {}", database.url))?;
    let store = SqliteUploadRecordStore::new(pool);

    let Command::Records { action } = cli.command;
    match action {
        RecordsCommand::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No upload records");
            }
            for record in records {
                let form = record
                    .upload_form
                    .as_ref()
                    .map(|f| format!("cdn{}:{}", f.cdn_number, f.cdn_key))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\tattempt={}\tform={}\tsession={}",
                    record.attachment_id,
                    record.tier,
                    record.attempt,
                    form,
                    if record.session_url.is_some() { "yes" } else { "no" },
                );
            }
        }
        RecordsCommand::Delete { attachment_id, tier } => {
            let tier: UploadTier = tier.parse()?;
            if store.remove(&attachment_id, tier).await? {
                tracing::info!(attachment_id = %attachment_id, tier = %tier, "Deleted upload record");
            } else {
                println!("No record for {} ({})", attachment_id, tier);
            }
        }
        RecordsCommand::PurgeExhausted { max } => {
            let max = max.unwrap_or(config.upload.max_record_attempts);
            let removed = store.remove_exhausted(max).await?;
            tracing::info!(removed, max_attempts = max, "Purged exhausted upload records");
        }
    }

    Ok(())
}
