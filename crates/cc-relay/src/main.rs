use cc_relay::config::RelaySettings;
use cc_relay::RelayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = if let Ok(path) = std::env::var("CC_RELAY_CONFIG_PATH") {
        RelaySettings::from_toml(path)?
    } else {
        RelaySettings::from_env()?
    };

    let server = RelayServer::new(config)?;
    server.start().await?;

    Ok(())
}
