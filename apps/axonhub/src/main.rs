use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use axonhub_common::GatewayConfigPatch;
use axonhub_core::{ChannelFileLoader, ChannelStore, HttpClientConfig, Pipeline, WreqExecutor};
use axonhub_router::{AppState, build_router};

#[derive(Debug, Parser)]
#[command(name = "axonhub", about = "LLM API gateway")]
struct Args {
    /// Listen address.
    #[arg(long, env = "AXONHUB_HOST")]
    host: Option<String>,
    /// Listen port.
    #[arg(long, env = "AXONHUB_PORT")]
    port: Option<u16>,
    /// Outbound proxy for upstream egress.
    #[arg(long, env = "AXONHUB_PROXY")]
    proxy: Option<String>,
    /// Channel definition file (JSON list of channels).
    #[arg(long, env = "AXONHUB_CHANNELS", default_value = "channels.json")]
    channels: String,
    /// Seconds of upstream SSE silence before a stream is abandoned.
    #[arg(long, env = "AXONHUB_STREAM_IDLE_SECS")]
    stream_idle_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,axonhub=debug")),
        )
        .init();

    let args = Args::parse();
    let mut patch = GatewayConfigPatch {
        channels_path: Some(args.channels),
        ..Default::default()
    };
    patch.overlay(GatewayConfigPatch {
        host: args.host,
        port: args.port,
        proxy: args.proxy,
        stream_idle_secs: args.stream_idle_secs,
        ..Default::default()
    });
    let config = patch.into_config().context("invalid configuration")?;

    let executor = WreqExecutor::new(HttpClientConfig::from_gateway(&config))
        .context("building upstream http client")?;
    let channels = Arc::new(ChannelStore::new(
        Arc::new(ChannelFileLoader::new(&config.channels_path)),
        Duration::from_secs(30),
    ));
    channels.warm_up().await;

    let state = Arc::new(AppState {
        pipeline: Pipeline::new(channels.clone(), executor)
            .with_outbound_proxy(config.proxy.clone()),
    });
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, channels = %config.channels_path, "axonhub listening");
    axum::serve(listener, router).await.context("server exited")?;
    Ok(())
}
