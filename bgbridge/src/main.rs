use bgbridge::{config::BridgeConfig, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();
    let config = BridgeConfig::from_env()?;
    Daemon::new(config).run().await
}
