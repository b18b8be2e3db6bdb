use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use runner_server::auth::{BearerAuth, EnvTokenProvider, FileTokenProvider, NoToken, TokenProvider};
use runner_server::config::{Args, ListenAddr, load_runtime_config};
use runner_server::service::RunnerServiceImpl;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_filter.as_str().into()),
        )
        .init();

    let provider: Box<dyn TokenProvider> = match &cfg.token_file {
        Some(path) => Box::new(EnvTokenProvider::new(FileTokenProvider::new(path))),
        None => Box::new(EnvTokenProvider::new(NoToken)),
    };
    let auth = BearerAuth::from_provider(provider.as_ref()).context("failed to load API token")?;

    let svc = RunnerServiceImpl::new(cfg.service.clone()).into_server(cfg.max_message_size);
    let router = Server::builder().add_service(InterceptedService::new(svc, auth));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    };

    match &cfg.listen {
        ListenAddr::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!("runnerd listening addr={}", listener.local_addr()?);
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                .await
                .context("runner server failed")?;
        }
        ListenAddr::Unix(path) => {
            remove_stale_socket(path)?;
            let listener = UnixListener::bind(path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            info!("runnerd listening addr={}", cfg.listen);
            let served = router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await;
            let _ = fs::remove_file(path);
            served.context("runner server failed")?;
        }
    }

    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}
