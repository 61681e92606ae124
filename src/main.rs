mod background;
mod config;
mod controller;
mod directive;
mod error;
mod processor;
mod response;
mod routes;
mod upload;

#[cfg(test)]
mod tests;

#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use poem::listener::TcpListener;
use poem::Server;
use tokio::sync::Semaphore;
use tracing::level_filters::LevelFilter;

use crate::controller::ImageController;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct ServerConfig {
    #[clap(long, env, default_value = "0.0.0.0")]
    /// The binding host address of the server.
    host: String,

    #[clap(short, long, env, default_value = "3000")]
    /// The port to bind the server to.
    port: u16,

    #[clap(long, env)]
    /// An optional YAML or JSON config file overriding the built in defaults.
    config_file: Option<PathBuf>,

    #[clap(long, env, default_value = "info")]
    /// The minimum level to log at.
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: ServerConfig = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    if let Err(e) = config::init(args.config_file.as_deref()).await {
        error!("Failed to load config file: {}", e);
        return Err(e);
    }

    let cfg = config::config();

    if let Err(e) = tokio::fs::create_dir_all(&cfg.temp_dir).await {
        error!("Failed to create temp directory {:?}: {}", &cfg.temp_dir, e);
        return Err(e.into());
    }

    let remover = background::connect(cfg.background_removal.as_ref())?;
    let global_limiter = cfg.max_concurrency.map(Semaphore::new).map(Arc::new);
    let timeout = cfg.processing_timeout.map(Duration::from_secs);

    let controller = ImageController::new(remover, cfg.temp_dir.clone(), global_limiter, timeout);
    let app = routes::build_app(controller, cfg.static_dir.clone(), &cfg.index_file);

    let addr: SocketAddr = format!("{}:{}", &args.host, args.port).parse()?;
    info!("Serving {:?} and listening on http://{}", &cfg.static_dir, addr);

    Server::new(TcpListener::bind(addr))
        .run_with_graceful_shutdown(
            app,
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down server");
            },
            Some(Duration::from_secs(2)),
        )
        .await?;

    Ok(())
}
