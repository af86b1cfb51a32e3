use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use qpxg::gateway::Gateway;
use qpxg::server::{self, ConnectionLimits};

#[derive(Parser)]
#[command(name = "qpxg", about = "qpx CGI/1.1 gateway")]
struct Cli {
    /// Listen address (TCP "host:port" or Unix socket path prefixed with "unix://").
    /// Overrides the config file's `listen` field when provided.
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Maximum concurrently running scripts. Overrides config.
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = qpxg::config::load_config(&cli.config)?;
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(workers) = cli.workers {
        cfg.workers = workers;
    }
    cfg.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let gateway = Arc::new(Gateway::from_config(&cfg)?);
    let limits = ConnectionLimits::from_config(&cfg);
    let listen = cfg.listen.clone();

    if let Some(path) = listen.strip_prefix("unix://") {
        #[cfg(unix)]
        {
            // Only remove an existing path if it is a Unix socket.
            if let Ok(meta) = std::fs::symlink_metadata(path) {
                use std::os::unix::fs::FileTypeExt;
                if meta.file_type().is_socket() {
                    let _ = std::fs::remove_file(path);
                } else {
                    return Err(anyhow!("path '{}' exists and is not a Unix socket", path));
                }
            }
            let listener = tokio::net::UnixListener::bind(path)?;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            info!(listen = %listen, workers = cfg.workers, handlers = cfg.handlers.len(), "qpxg listening (Unix socket)");

            let conn_semaphore = Arc::new(Semaphore::new(cfg.max_connections));
            loop {
                let (stream, _) = listener.accept().await?;
                let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("too many concurrent connections; dropping unix connection");
                        continue;
                    }
                };
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) =
                        server::handle_connection(stream, gateway, limits, None, None).await
                    {
                        warn!(error = %e, "connection error");
                    }
                });
            }
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            return Err(anyhow!("Unix sockets are not supported on this platform"));
        }
    }

    let listener = TcpListener::bind(&listen).await?;
    info!(listen = %listen, workers = cfg.workers, handlers = cfg.handlers.len(), "qpxg listening (TCP)");
    server::serve_tcp(listener, gateway, limits, cfg.max_connections).await
}
