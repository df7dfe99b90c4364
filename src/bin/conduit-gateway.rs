use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use conduit_gateway::gateway::http::{GatewayHttpState, router};
use conduit_gateway::gateway::telemetry::{TelemetryOptions, init_tracing};
use conduit_gateway::gateway::{Gateway, GatewayConfig};

/// Multi-tenant AI gateway.
#[derive(Debug, Parser)]
#[command(name = "conduit-gateway", version, about)]
struct Args {
    /// Gateway config (.json, .toml, or .yaml with `gateway-config-yaml`).
    config: PathBuf,

    /// Overrides `listen` from the config.
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<String>,

    #[arg(long)]
    json_logs: bool,

    /// Shared rate-limit counters. Requires `gateway-store-redis`.
    #[arg(long, value_name = "URL")]
    redis: Option<String>,

    #[arg(long)]
    redis_prefix: Option<String>,

    /// Export spans over OTLP/HTTP. Requires `gateway-otel`.
    #[arg(long)]
    otel: bool,

    #[arg(long, value_name = "URL")]
    otel_endpoint: Option<String>,

    /// How long shutdown waits for pending usage events.
    #[arg(long, default_value_t = 10)]
    drain_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _telemetry = init_tracing(
        "conduit-gateway",
        &TelemetryOptions {
            json_logs: args.json_logs,
            otel: args.otel || args.otel_endpoint.is_some(),
            otel_endpoint: args.otel_endpoint.clone(),
        },
    )?;

    let mut config = GatewayConfig::from_path(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(redis_url) = args.redis {
        config.redis_url = Some(redis_url);
    }
    if let Some(prefix) = args.redis_prefix {
        config.redis_prefix = Some(prefix);
    }

    let listen = config.listen.clone();
    let max_body_bytes = config.max_body_bytes;
    let gateway = Arc::new(Gateway::builder(config).build().await?);
    gateway.start_background_refresh();

    let state = GatewayHttpState::new(gateway.clone()).with_max_body_bytes(max_body_bytes);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "conduit-gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let drained = gateway
        .shutdown(Duration::from_secs(args.drain_timeout_secs))
        .await;
    if drained {
        tracing::info!("usage accounting drained");
    } else {
        tracing::error!(data_loss = true, "usage accounting did not drain before the deadline");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
