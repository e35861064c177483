use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;

use senteros_relay::config::{self, API_KEY_ENV};
use senteros_relay::logger;
use senteros_relay::relay::Relay;
use senteros_relay::router::{run_router, RouterState};
use senteros_relay::upstream::{OpenRouterClient, UpstreamClient};

#[derive(Parser)]
#[command(name = "senteros-relay", about = "Streaming chat relay for OpenRouter-compatible APIs")]
struct Cli {
  /// Address to bind
  #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
  host: String,

  /// Port to listen on
  #[arg(long, default_value_t = 5000, env = "RELAY_PORT")]
  port: u16,

  /// Path to the JSON config file, created with defaults if missing
  #[arg(long, default_value = "relay.json", env = "RELAY_CONFIG")]
  config: PathBuf,

  /// Verbose logging
  #[arg(long)]
  debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  logger::init(cli.debug);

  let config = config::load_or_init(&cli.config)
    .with_context(|| format!("failed to load config from {}", cli.config.display()))?
    .with_env_overrides();
  if config.api_key.trim().is_empty() {
    tracing::warn!("no API key configured; set api_key in the config file or {API_KEY_ENV}");
  }
  tracing::info!(
    upstream = %config.upstream_url,
    default_model = %config.models.default,
    thinking_model = %config.models.thinking,
    timeout_secs = config.timeout_secs,
    "config loaded"
  );
  let config = Arc::new(config);

  let upstream: Arc<dyn UpstreamClient> = Arc::new(OpenRouterClient::new(config.clone())?);
  let state = RouterState {
    started_at: Instant::now(),
    config: config.clone(),
    relay: Relay::new(config, upstream),
  };

  let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
    .parse()
    .with_context(|| format!("invalid bind address {}:{}", cli.host, cli.port))?;
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .with_context(|| format!("failed to bind {addr}"))?;
  tracing::info!(%addr, "relay listening");

  run_router(listener, state).await
}
