use std::str::FromStr;

use clap::Parser;
use forge_core::config::ForgeConfig;
use forge_core::Channel;
use forge_resilience::{
    generator_for, ControllerEvent, ControllerOptions, ResilienceController, ResilienceSupervisor,
    WsTransport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forge-watch")]
#[command(version)]
#[command(about = "Follow ForgeBoard channels with synthetic fallback", long_about = None)]
struct Args {
    /// Gateway root URL
    #[arg(long, default_value = "ws://127.0.0.1:3333")]
    url: String,

    /// Channel to follow; repeat for several
    #[arg(long = "channel", required = true)]
    channels: Vec<String>,

    /// Per-connection cadence to request on poll-driven channels
    #[arg(long)]
    interval_ms: Option<u64>,

    #[arg(long)]
    config: Option<String>,

    /// Seed for synthetic data and backoff jitter
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forge_resilience=info,forge_watch=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match ForgeConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            warn!("Config load failed ({}), using defaults", e);
            ForgeConfig::default()
        }
    };
    let seed = args.seed.unwrap_or_else(rand::random);

    let mut supervisor = ResilienceSupervisor::new();
    for (i, name) in args.channels.iter().enumerate() {
        let channel = Channel::from_str(name)?;
        let mut transport = WsTransport::new(&args.url, channel);
        if let Some(ms) = args.interval_ms {
            transport = transport.with_interval(ms);
        }
        let mut options = ControllerOptions::from_config(&config.resilience);
        options.seed = seed.wrapping_add(i as u64);
        let controller = ResilienceController::new(
            channel,
            transport,
            generator_for(channel, options.seed),
            options,
        );

        let mut events = controller.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ControllerEvent::Transition { channel, from, to, retry_count, .. }) => {
                        info!(%channel, %from, %to, retry_count, "transition");
                    }
                    Ok(ControllerEvent::Sample(sample)) => {
                        debug!(
                            channel = %sample.channel,
                            seq = sample.seq,
                            provenance = ?sample.provenance,
                            data = %sample.data,
                            "sample"
                        );
                    }
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagging"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        supervisor.spawn(controller).await;
    }

    let mut summaries = supervisor.board().subscribe();
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("ctrl-c handler failed: {}", e);
                }
                break;
            }
            changed = summaries.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary = summaries.borrow_and_update().clone();
                info!(all_live = summary.all_live, any_synthetic = summary.any_synthetic, "status");
            }
        }
    }

    supervisor.shutdown_all().await;
    for (channel, phase) in supervisor.statuses() {
        info!(%channel, %phase, "final state");
    }
    Ok(())
}
