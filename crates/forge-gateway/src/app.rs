use std::sync::Arc;

use axum::{routing::get, Router};
use forge_core::config::ForgeConfig;
use forge_core::Channel;
use forge_pipeline::{BatchPipeline, MemoryEventStore, PersistBatches};
use forge_registry::ConnectionRegistry;
use tower_http::cors::{Any, CorsLayer};

use crate::broadcast::{BroadcastGateway, GatewayOptions};
use crate::producer::{HealthProducer, RegistryStatusProducer, SystemMetricsProducer};

/// Recent log events kept for `GET /api/logs`.
const LOG_STORE_CAPACITY: usize = 1_000;

/// Shared state handed to every Axum handler as `Arc<AppState>`.
pub struct AppState {
    pub config: ForgeConfig,
    pub gateway: Arc<BroadcastGateway>,
    pub pipeline: BatchPipeline,
    pub store: Arc<MemoryEventStore>,
}

impl AppState {
    /// Wire the standard channel set around an already running pipeline:
    /// `metrics`, `health` and `diagnostics` are poll-driven, `logs` is fed
    /// by the pipeline, which also persists into the in-memory store.
    pub fn build(config: ForgeConfig, pipeline: BatchPipeline) -> Arc<Self> {
        Self::with_options(
            config.clone(),
            pipeline,
            GatewayOptions::from_config(&config.cadence),
        )
    }

    pub fn with_options(
        config: ForgeConfig,
        pipeline: BatchPipeline,
        options: GatewayOptions,
    ) -> Arc<Self> {
        let registry = ConnectionRegistry::new(config.registry.clone());
        let gateway = BroadcastGateway::new(Arc::clone(&registry), options);

        gateway.register_poller(Channel::Metrics, SystemMetricsProducer::new());
        gateway.register_poller(Channel::Health, HealthProducer::new());
        gateway.register_poller(Channel::Diagnostics, RegistryStatusProducer::new(registry));

        let store = Arc::new(MemoryEventStore::new(LOG_STORE_CAPACITY));
        pipeline.on_batch(PersistBatches::new(Arc::clone(&store)));
        gateway.attach_pipeline(&pipeline, Channel::Logs);

        Arc::new(Self {
            config,
            gateway,
            pipeline,
            store,
        })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws/{channel}", get(crate::ws::connection::ws_handler))
        .route(
            "/api/connections",
            get(crate::http::connections::active_handler),
        )
        .route(
            "/api/connections/history",
            get(crate::http::connections::history_handler),
        )
        .route(
            "/api/connections/activity",
            get(crate::http::connections::activity_handler),
        )
        .route("/api/metrics", get(crate::http::metrics::metrics_handler))
        .route(
            "/api/metrics/set-interval",
            get(crate::http::metrics::set_interval_handler),
        )
        .route("/api/logs", get(crate::http::logs::logs_handler))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
