use anyhow::{Error, Result};
use notify_api::{api::run_api_server, config::Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // amqps:// URLs need a process-wide rustls provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load()?;

    run_api_server(config).await
}
