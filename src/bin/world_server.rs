use std::sync::Arc;

use anyhow::{Context, Result};
use realmnet::config::ServerConfig;
use realmnet::servers::world::{self, CharacterSummary, MemoryWorld, Position, ShopItem, World};
use realmnet::servers::{bind, init_tracing, parse_conf_arg, shutdown_on_ctrl_c, Host};

/// Inventory slots per character in the in-memory world.
const INVENTORY_SLOTS: usize = 52;

/// A small world to log into when no backend is wired up.
fn demo_world() -> MemoryWorld {
    let world = MemoryWorld::new(INVENTORY_SLOTS).accept_any_ticket();
    for account_id in 1..=3u32 {
        world.add_character(
            account_id,
            CharacterSummary {
                id: account_id * 100,
                name: format!("Hero{}", account_id),
                level: 1,
                class: 0,
            },
            Position { map: 0, x: 8, y: 7 },
            500,
        );
    }
    world.add_shop(
        1,
        vec![
            ShopItem { item_id: 1001, price: 10 },
            ShopItem { item_id: 1002, price: 250 },
        ],
    );
    world
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let Some(conf_file) = parse_conf_arg("world_server") else {
        return Ok(());
    };
    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    tracing::warn!("[world] using the in-memory demo world, tickets are not checked");
    let world = Arc::new(World::new(Arc::new(demo_world()))?);
    let registry = world::registry(world).context("Invalid world protocol table")?;

    let host = Host::new("world", &config, registry)?;
    shutdown_on_ctrl_c(host.state().clone());
    let listener = bind(&config, config.world_port).await?;

    tracing::info!("[world] [started] World Server Started");
    host.run(listener).await
}
