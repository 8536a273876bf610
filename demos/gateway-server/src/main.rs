//! Messaging gateway server.
//!
//! Run with: cargo run -p switchboard-server -- --config demos/gateway-server/gateway.toml
//!
//! Applications talk to the gateway over the in-process bus: inbound
//! messages on `inbound.<transport>`, replies on `outbound.<transport>`.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use switchboard_core::{
    AckEvent, DeliveryReport, MemoryBus, MessageBus, MiddlewareConfig, MiddlewareStack,
    RoutingKey, consume,
};
use switchboard_session::MemoryCache;
use switchboard_transport::{
    OutboundWorker, SmsConfig, SmsTransport, Transport, UssdConfig, UssdTransport,
    create_gateway_router,
};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "USSD and SMS messaging gateway")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerConfig {
    bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    server: ServerConfig,
    middleware: Vec<MiddlewareConfig>,
    ussd: Option<UssdConfig>,
    sms: Option<SmsConfig>,
}

impl GatewayConfig {
    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(args.config.as_deref())?;
    let bind = args.bind.unwrap_or(config.server.bind);

    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let pipeline = MiddlewareStack::from_config(&config.middleware)?;
    tracing::info!(stages = pipeline.len(), "Middleware configured");

    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if let Some(ussd) = config.ussd {
        transports.push(Arc::new(UssdTransport::new(
            ussd,
            MemoryCache::new(),
            Arc::clone(&bus),
            pipeline.clone(),
        )));
    }

    if let Some(sms) = config.sms {
        let name = sms.transport_name.clone();
        transports.push(Arc::new(SmsTransport::new(
            sms,
            Arc::clone(&bus),
            pipeline.clone(),
        )?));
        tasks.push(
            consume(
                bus.as_ref(),
                RoutingKey::ack(&name).as_str(),
                |ack: AckEvent| async move {
                    tracing::info!(
                        message_id = %ack.message_id,
                        transport_message_id = %ack.transport_message_id,
                        "Ack"
                    );
                },
            )
            .await?,
        );
        tasks.push(
            consume(
                bus.as_ref(),
                RoutingKey::receipt(&name).as_str(),
                |report: DeliveryReport| async move {
                    tracing::info!(
                        message_id = %report.message_id,
                        status = %report.status,
                        "Delivery report"
                    );
                },
            )
            .await?,
        );
    }

    if transports.is_empty() {
        tracing::warn!("No transports configured, serving the health check only");
    }

    for transport in &transports {
        tasks.push(
            OutboundWorker::spawn(Arc::clone(transport), Arc::clone(&bus), pipeline.clone())
                .await?,
        );
    }

    let app = create_gateway_router(&transports);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!("Gateway listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in &tasks {
        task.abort();
    }
    for transport in &transports {
        transport.shutdown().await;
    }
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}
