use std::sync::Arc;

use anyhow::{Context, Result};
use realmnet::config::ServerConfig;
use realmnet::servers::auth::{self, MemoryAccountStore};
use realmnet::servers::{bind, init_tracing, parse_conf_arg, shutdown_on_ctrl_c, Host};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let Some(conf_file) = parse_conf_arg("auth_server") else {
        return Ok(());
    };
    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    if config.accounts.is_empty() {
        tracing::warn!("[auth] no accounts configured, every login will fail with NOUSER");
    }
    let store = Arc::new(MemoryAccountStore::from_entries(&config.accounts));
    let registry = auth::registry(store).context("Invalid auth protocol table")?;

    let host = Host::new("auth", &config, registry)?;
    shutdown_on_ctrl_c(host.state().clone());
    let listener = bind(&config, config.auth_port).await?;

    tracing::info!("[auth] [started] Auth Server Started");
    host.run(listener).await
}
