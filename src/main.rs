//! LMS Client - chunked uploads and authenticated requests from the shell

use anyhow::Context;
use clap::{Parser, Subcommand};
use lms_client::auth::{
    AuthGateway, CredentialStore, FileCredentialStore, LogSessionHooks, MemoryCredentialStore,
};
use lms_client::config::{Config, DispatchMode};
use lms_client::upload::presigned::PresignedUploader;
use lms_client::upload::{ChunkedTransferClient, UploadError, UploadOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// LMS Client - chunked uploads with retry, cancellation and session refresh
#[derive(Parser, Debug)]
#[command(name = "lms-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "LMS_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// API base URL (overrides api.base_url)
    #[arg(long)]
    base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file through the chunked protocol
    Upload {
        file: PathBuf,

        #[arg(long)]
        title: String,

        #[arg(long)]
        description: Option<String>,

        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Chunks in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Use a worker pool instead of sequential batches
        #[arg(long)]
        pooled: bool,
    },

    /// Show the server's view of an upload session
    Status { upload_id: String },

    /// Discard an upload session on the server
    Cancel { upload_id: String },

    /// Upload a small file through a pre-signed URL
    PutSigned {
        file: PathBuf,

        /// Object path to sign
        #[arg(long)]
        path: String,

        #[arg(long)]
        content_type: Option<String>,
    },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match (&args.config, &args.base_url) {
        (Some(path), _) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        (None, Some(base_url)) => Config::with_base_url(base_url),
        (None, None) => anyhow::bail!("either --config or --base-url is required"),
    };

    if let Some(ref base_url) = args.base_url {
        config.api.base_url = base_url.clone();
    }
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run_upload(
    config: &Config,
    file: PathBuf,
    title: String,
    description: Option<String>,
    options: UploadOptions,
) -> anyhow::Result<()> {
    let client = Arc::new(ChunkedTransferClient::from_config(config)?);

    let ctrl_c_client = Arc::clone(&client);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_client.cancel();
        }
    });

    let result = client
        .upload(&file, &title, description.as_deref(), options)
        .await;
    ctrl_c.abort();

    match result {
        Ok(resource) => {
            println!("{}", serde_json::to_string_pretty(&resource)?);
            Ok(())
        }
        Err(UploadError::Cancelled) => {
            eprintln!("Upload cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    lms_client::telemetry::init_subscriber(&config.logging)?;
    info!("Starting LMS client v{}", lms_client::VERSION);

    match args.command {
        Command::Upload {
            file,
            title,
            description,
            chunk_size,
            concurrency,
            pooled,
        } => {
            let mut options = UploadOptions::from_config(&config).on_progress(|progress| {
                eprintln!(
                    "{}/{} chunks ({:.1}%)",
                    progress.uploaded_chunks, progress.total_chunks, progress.percentage
                );
            });
            if let Some(chunk_size) = chunk_size {
                options = options.with_chunk_size(chunk_size);
            }
            if let Some(concurrency) = concurrency {
                options = options.with_concurrency(concurrency);
            }
            if pooled {
                options = options.with_dispatch(DispatchMode::Pooled);
            }

            run_upload(&config, file, title, description, options).await?;
        }
        Command::Status { upload_id } => {
            let client = ChunkedTransferClient::from_config(&config)?;
            let status = client.status(config.upload_base_url(), &upload_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Cancel { upload_id } => {
            let client = ChunkedTransferClient::from_config(&config)?;
            client
                .abort_remote(config.upload_base_url(), &upload_id)
                .await?;
            println!("Upload {} cancelled", upload_id);
        }
        Command::PutSigned {
            file,
            path,
            content_type,
        } => {
            let store: Arc<dyn CredentialStore> = match config.auth.credentials_file {
                Some(ref credentials_file) => {
                    Arc::new(FileCredentialStore::new(credentials_file.clone()))
                }
                None => Arc::new(MemoryCredentialStore::new()),
            };
            let gateway = Arc::new(AuthGateway::from_config(
                &config,
                store,
                Arc::new(LogSessionHooks::default()),
            )?);

            let uploader = PresignedUploader::new(gateway);
            let signed_url = uploader
                .upload_file(&file, &path, content_type.as_deref())
                .await?;
            println!("{}", signed_url);
        }
    }

    if config.metrics.enabled {
        eprintln!("{}", lms_client::metrics::gather_text());
    }

    Ok(())
}
