use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use media_vault_uploads::broker::{wire, GrantBroker, GrantRequest, HttpBroker};
use media_vault_uploads::config::Config;
use media_vault_uploads::errors::{AppError, AppResult};
use media_vault_uploads::logging::init_tracing;
use media_vault_uploads::models::{BatchItem, BatchResult, Operation, Secret};
use media_vault_uploads::progress::ProgressSnapshot;
use media_vault_uploads::session::{HttpSessionAuthority, SessionContext};
use media_vault_uploads::transport::HttpTransport;
use media_vault_uploads::upload::batch::BatchRun;
use media_vault_uploads::upload::{BatchOrchestrator, MultipartCoordinator};
use media_vault_uploads::utils::{generate_object_key, guess_content_type};

#[derive(Parser, Debug)]
#[command(name = "vault-admin")]
#[command(about = "Upload, delete and sign objects in the media vault", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = "vault.json")]
    config: PathBuf,

    /// Bearer token from the identity provider
    #[arg(long, env = "VAULT_IDENTITY_TOKEN", hide_env_values = true)]
    identity_token: String,

    /// Admin password forwarded to the broker
    #[arg(long, env = "VAULT_ADMIN_SECRET", hide_env_values = true)]
    admin_secret: String,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload one file as a multipart upload
    Upload {
        file: PathBuf,
        /// Object key; generated from the file name when omitted
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Upload many small files, one signed PUT each
    BatchUpload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Delete objects by key
    BatchDelete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// List objects under a prefix
    Search {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Print a presigned URL for one operation
    Sign {
        /// get, put or delete
        operation: Operation,
        key: String,
        #[arg(long)]
        expires_in: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.json_logs);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vault-admin failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> AppResult<()> {
    let mut config = Config::load(&args.config)?;
    config.apply_env();
    config.validate()?;

    let client = wire::http_client(&config)?;
    let authority = Arc::new(HttpSessionAuthority::from_config(client.clone(), &config)?);
    let ctx = SessionContext::new(
        authority,
        Secret::new(args.identity_token),
        Secret::new(args.admin_secret),
    )
    .with_retry(config.retry.clone())
    .with_margin(config.expiry_margin());

    let broker = Arc::new(HttpBroker::new(client.clone(), &config)?);
    let transport = Arc::new(HttpTransport::new(client));

    match args.command {
        Command::Upload {
            file,
            key,
            content_type,
            prefix,
        } => {
            let key = match key {
                Some(key) => key,
                None => object_key(&file, prefix.as_deref(), content_type.as_deref())?,
            };
            let coordinator = MultipartCoordinator::new(broker, transport, config);
            let session = coordinator
                .begin_file(&ctx, &file, &key, content_type.as_deref())
                .await?;
            let watcher = watch_progress(session.progress().subscribe());
            let url = coordinator.finish_file(&ctx, &session, &file).await;
            watcher.abort();
            println!("{}", url?);
        }
        Command::BatchUpload { files, prefix } => {
            let mut items = Vec::with_capacity(files.len());
            let mut unreadable = Vec::new();
            for (index, file) in files.iter().enumerate() {
                match read_upload(file, prefix.as_deref()).await {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        tracing::warn!(file = %file.display(), error = %e, "skipping unreadable file");
                        let path = file.display().to_string();
                        unreadable.push((index, BatchResult::failed(path, e.to_string())));
                    }
                }
            }
            let operation = Operation::Upload;
            run_batch(&ctx, broker, transport, config, operation, items, unreadable).await?;
        }
        Command::BatchDelete { keys } => {
            let items = keys.into_iter().map(BatchItem::delete).collect();
            let operation = Operation::Delete;
            run_batch(&ctx, broker, transport, config, operation, items, Vec::new()).await?;
        }
        Command::Search { prefix } => {
            let credentials = ctx.session_credentials().await?;
            let page = broker.search(&credentials, &config.bucket, &prefix).await?;
            print_json(&page)?;
        }
        Command::Sign {
            operation,
            key,
            expires_in,
        } => {
            let credentials = ctx.session_credentials().await?;
            let request = GrantRequest::new(
                operation,
                config.bucket.clone(),
                key,
                expires_in.unwrap_or(config.grant_ttl_secs),
            );
            let grant = broker.request_grant(&credentials, &request).await?;
            print_json(&grant)?;
        }
    }
    Ok(())
}

async fn run_batch(
    ctx: &SessionContext,
    broker: Arc<HttpBroker>,
    transport: Arc<HttpTransport>,
    config: Config,
    operation: Operation,
    items: Vec<BatchItem>,
    unreadable: Vec<(usize, BatchResult)>,
) -> AppResult<()> {
    let cancel = CancellationToken::new();
    let run = BatchRun::new(config.concurrency_limit).with_cancel(cancel.clone());

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing in-flight items");
            cancel.cancel();
        }
    });
    let watcher = watch_progress(run.progress.subscribe());

    let orchestrator = BatchOrchestrator::new(broker, transport, config);
    let results = orchestrator.run(ctx, operation, items, &run).await;
    interrupt.abort();
    watcher.abort();

    let results = merge_results(results?, unreadable);
    print_json(&results)?;
    if results.iter().any(|r| !r.success) {
        return Err(AppError::Broker(format!(
            "{} of {} items failed",
            results.iter().filter(|r| !r.success).count(),
            results.len()
        )));
    }
    Ok(())
}

/// Puts results for items that never reached the orchestrator back at their
/// original positions. `placed` must be sorted by index.
fn merge_results(
    mut results: Vec<BatchResult>,
    placed: Vec<(usize, BatchResult)>,
) -> Vec<BatchResult> {
    for (index, result) in placed {
        let index = index.min(results.len());
        results.insert(index, result);
    }
    results
}

async fn read_upload(file: &Path, prefix: Option<&str>) -> AppResult<BatchItem> {
    let content_type = file_content_type(file);
    let key = object_key(file, prefix, Some(&content_type))?;
    let payload = Bytes::from(tokio::fs::read(file).await?);
    Ok(BatchItem::upload(key, Some(content_type), payload))
}

fn watch_progress(
    mut progress: tokio::sync::watch::Receiver<ProgressSnapshot>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            tracing::info!(percent = snapshot.percent, "{}", snapshot.status);
        }
    })
}

fn file_content_type(file: &Path) -> String {
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    guess_content_type(name).to_string()
}

fn object_key(file: &Path, prefix: Option<&str>, content_type: Option<&str>) -> AppResult<String> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::InvalidField {
            field: "file".to_string(),
            reason: format!("{} has no usable file name", file.display()),
        })?;
    let content_type = content_type.unwrap_or_else(|| guess_content_type(name));
    Ok(generate_object_key(prefix, name, content_type))
}

fn print_json<T: serde::Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
