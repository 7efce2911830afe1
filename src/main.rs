use tracing::info;

use estuary::irc::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        server = %config.server_name,
        token = %config.token,
        peers = config.peers.len(),
        "estuary: configured"
    );

    estuary::irc::server::run(config).await
}
