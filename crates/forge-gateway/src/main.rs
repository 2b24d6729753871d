use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use forge_core::config::ForgeConfig;
use forge_gateway::app;
use forge_pipeline::{BatchPipeline, PipelineLayer, SourceFilter};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forge-gateway")]
#[command(version)]
#[command(about = "ForgeBoard real-time telemetry gateway", long_about = None)]
struct Args {
    /// Config file (falls back to FORGE_CONFIG, then ~/.forgeboard/forge.toml)
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Batch flush window in milliseconds
    #[arg(long)]
    flush_window_ms: Option<u64>,

    /// Events that force an immediate batch flush
    #[arg(long)]
    max_batch_size: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut ForgeConfig) {
        if let Some(bind) = &self.bind {
            config.gateway.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(ms) = self.flush_window_ms {
            config.batch.flush_window_ms = ms;
        }
        if let Some(size) = self.max_batch_size {
            config.batch.max_batch_size = size;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // load config: --config > FORGE_CONFIG env > ~/.forgeboard/forge.toml
    let loaded = ForgeConfig::load(args.config.as_deref());
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    args.apply(&mut config);
    config.validate()?;

    // The pipeline has to exist before tracing is installed so the logs
    // channel sees startup messages too.
    let pipeline = BatchPipeline::spawn(config.batch.clone(), Arc::new(SourceFilter::default()));
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "forge_gateway=info,forge_registry=info,forge_pipeline=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(PipelineLayer::new(pipeline.clone()))
        .init();

    if let Err(e) = &loaded {
        warn!("Config load failed ({}), using defaults", e);
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = app::AppState::build(config, pipeline.clone());
    let pollers = state.gateway.spawn_pollers();
    let router = app::build_router(Arc::clone(&state));

    info!("ForgeBoard gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // stop timers first so nothing new is queued, then drain the logs
    state.gateway.shutdown();
    for poller in pollers {
        let _ = poller.await;
    }
    let released = state.gateway.release_all("server-shutdown");
    info!(released, "connections released");
    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
