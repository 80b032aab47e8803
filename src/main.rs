use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thor::config::{ClientConfig, DEFAULT_ADDRESS, ServerConfig, normalize_address};
use thor::services::dispatcher::UploadDispatcher;
use thor::services::storage::StagingStore;
use thor::services::transfer::HttpTransfer;
use thor::services::upload_service::UploadService;
use thor::{AppState, create_app};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "thor", version, about = "File upload server and bulk upload client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the upload server
    Server(ServerArgs),
    /// Upload a file or every file under a directory
    Upload(UploadArgs),
}

#[derive(clap::Args)]
struct ServerArgs {
    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<String>,
    /// Directory uploads are saved under
    #[arg(short = 'd', long = "dir")]
    save_dir: Option<String>,
    /// Allowed extensions, `|`-delimited, or `*`
    #[arg(short = 'e', long = "ext")]
    file_ext: Option<String>,
    /// Maximum upload size, in units
    #[arg(short = 's', long = "size")]
    file_size: Option<String>,
    /// Size unit in bytes
    #[arg(short = 'u', long = "unit")]
    file_unit: Option<String>,
}

impl ServerArgs {
    fn overrides(&self) -> Vec<(&'static str, &str)> {
        [
            ("port", &self.port),
            ("dir", &self.save_dir),
            ("ext", &self.file_ext),
            ("size", &self.file_size),
            ("unit", &self.file_unit),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|v| (key, v)))
        .collect()
    }
}

#[derive(clap::Args)]
struct UploadArgs {
    /// File or directory to upload
    path: PathBuf,
    /// Upload endpoint, e.g. `host:8080` or `http://host:8080/upload`
    #[arg(default_value = DEFAULT_ADDRESS)]
    address: String,
    /// Transfers in flight at once
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,
    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Do not send an md5 field
    #[arg(long)]
    no_md5: bool,
    /// Recreate the local directory layout under the server's save directory
    #[arg(long)]
    preserve_tree: bool,
    /// Send files larger than this many bytes as merged chunks
    #[arg(long)]
    split_size: Option<u64>,
}

impl UploadArgs {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_env();
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs(secs);
        }
        if self.no_md5 {
            config.checksum = false;
        }
        if self.preserve_tree {
            config.preserve_tree = true;
        }
        if self.split_size.is_some() {
            config.split_size = self.split_size;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "thor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Server(args) => serve(args).await,
        Command::Upload(args) => upload(args).await,
    }
}

async fn serve(args: ServerArgs) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env();
    config
        .update(args.overrides())
        .context("invalid server option")?;
    let policy = config.policy().context("invalid server configuration")?;

    tokio::fs::create_dir_all(&config.save_dir)
        .await
        .with_context(|| format!("cannot create {}", config.save_dir.display()))?;

    info!("Starting thor upload server...");
    info!("Config: {}", config.to_json());
    info!(
        "Upload policy: extensions={}, max size={} bytes",
        policy.allowed_extensions, policy.max_bytes
    );

    let upload_service = Arc::new(UploadService::new(
        StagingStore::new(config.save_dir.clone()),
        policy,
    ));
    let state = AppState::new(upload_service);

    let app = create_app(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("{} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!("Finished in {:?} with status {}", latency, response.status());
                },
            ),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;
    info!("Server ready at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down gracefully.");
    Ok(())
}

async fn upload(args: UploadArgs) -> anyhow::Result<()> {
    let config = args.client_config();
    validator::Validate::validate(&config).context("invalid upload options")?;
    let address = normalize_address(&args.address)?;

    info!(
        "Uploading {} to {} with {} workers",
        args.path.display(),
        address,
        config.concurrency
    );

    let transfer = Arc::new(HttpTransfer::new(&config).context("cannot build HTTP client")?);
    let dispatcher = UploadDispatcher::new(transfer, &config);
    let outcome = dispatcher.run(&args.path, &address).await?;

    if !outcome.is_clean() {
        tracing::warn!(
            "{} of {} uploads failed",
            outcome.failed,
            outcome.attempted
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("SIGTERM received, starting graceful shutdown...");
        },
    }
}
