//! World process
//!
//! Sessions walk `Login -> Select -> Loading -> Game`: redeem the gateway
//! ticket, pick a character, load the map, then play. Game data comes from a
//! [`WorldBackend`].

pub mod backend;
pub mod chat;
pub mod packet;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::dispatch::{Handler, Registry, RegistryBuilder};
use crate::packet::{CodecError, Record, Value};
use crate::session::{Phases, Session};

pub use backend::{CharacterSummary, MemoryWorld, Position, Purchase, ShopItem, WorldBackend};
pub use chat::ChatChannel;
pub use packet::WorldSchemas;

use packet::{clip, CHARACTER_SLOTS, MAX_CHAT_LEN, NAME_LEN, SHOP_ITEM_LEN};

/// Length of one in-game day on the server clock.
pub const GAME_DAY_MS: u32 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldPhase {
    Login,
    Select,
    Loading,
    Game,
}

impl Phases for WorldPhase {
    fn entry() -> Self {
        WorldPhase::Login
    }

    fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (WorldPhase::Login, WorldPhase::Select)
                | (WorldPhase::Select, WorldPhase::Loading)
                | (WorldPhase::Loading, WorldPhase::Game)
        )
    }

    fn code(self) -> u8 {
        match self {
            WorldPhase::Login => 1,
            WorldPhase::Select => 2,
            WorldPhase::Loading => 3,
            WorldPhase::Game => 4,
        }
    }
}

/// Account a session redeemed its ticket for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account(pub u32);

/// Character the session is playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCharacter(pub CharacterSummary);

/// State shared by every world handler.
pub struct World {
    pub backend: Arc<dyn WorldBackend>,
    pub schemas: WorldSchemas,
    pub chat: ChatChannel,
}

impl World {
    pub fn new(backend: Arc<dyn WorldBackend>) -> Result<Self, CodecError> {
        Ok(Self {
            backend,
            schemas: WorldSchemas::build()?,
            chat: ChatChannel::new(),
        })
    }
}

/// Build the world dispatch table around `world`.
pub fn registry(world: Arc<World>) -> Result<Registry<WorldPhase>, CodecError> {
    let s = &world.schemas;
    RegistryBuilder::new()
        .register_in(s.enter_world.clone(), Arc::new(EnterWorld(world.clone())), &[WorldPhase::Login])
        .register_in(
            s.select_character.clone(),
            Arc::new(SelectCharacter(world.clone())),
            &[WorldPhase::Select],
        )
        .register_in(s.loading_done.clone(), Arc::new(LoadingDone(world.clone())), &[WorldPhase::Loading])
        .register_in(s.chat_in.clone(), Arc::new(Chat(world.clone())), &[WorldPhase::Game])
        .register_in(s.shop_buy.clone(), Arc::new(ShopBuy(world.clone())), &[WorldPhase::Game])
        .register(s.ping.clone(), Arc::new(Ping(world.clone())))
        .declare(s.character_list.clone())
        .declare(s.world_load.clone())
        .declare(s.chat_out.clone())
        .declare(s.pong.clone())
        .declare(s.shop_open.clone())
        .declare(s.shop_not_enough_money.clone())
        .declare(s.shop_no_space_left.clone())
        .build()
}

fn character_slot(c: Option<&CharacterSummary>) -> Value {
    let record = match c {
        Some(c) => Record::new()
            .with("id", c.id)
            .with("name", clip(&c.name, NAME_LEN))
            .with("level", c.level)
            .with("class", c.class),
        None => Record::new()
            .with("id", 0u32)
            .with("name", "")
            .with("level", 0u16)
            .with("class", 0u8),
    };
    Value::from(record)
}

fn shop_listing(items: &[ShopItem]) -> Vec<u8> {
    let max = usize::from(u8::MAX) / SHOP_ITEM_LEN;
    items
        .iter()
        .take(max)
        .flat_map(|i| i.item_id.to_le_bytes().into_iter().chain(i.price.to_le_bytes()))
        .collect()
}

pub struct EnterWorld(Arc<World>);

#[async_trait]
impl Handler<WorldPhase> for EnterWorld {
    async fn handle(&self, session: &mut Session<WorldPhase>, record: Record) -> anyhow::Result<()> {
        let account_id = record.u32("account_id").context("missing account_id")?;
        let ticket = record.u32("ticket").context("missing ticket")?;

        if !self.0.backend.redeem_ticket(account_id, ticket).await? {
            tracing::warn!("[world] [enter] bad ticket id={} account={}", session.id(), account_id);
            session.close();
            return Ok(());
        }
        session.attach(Account(account_id));

        let characters = self.0.backend.characters(account_id).await?;
        let slots: Vec<Value> = (0..CHARACTER_SLOTS).map(|i| character_slot(characters.get(i))).collect();
        let count = characters.len().min(CHARACTER_SLOTS) as u8;

        session.advance(WorldPhase::Select)?;
        session.send(
            &self.0.schemas.character_list,
            Record::new().with("count", count).with("characters", Value::Array(slots)),
        )?;
        tracing::info!("[world] [enter] id={} account={} characters={}", session.id(), account_id, count);
        Ok(())
    }
}

pub struct SelectCharacter(Arc<World>);

#[async_trait]
impl Handler<WorldPhase> for SelectCharacter {
    async fn handle(&self, session: &mut Session<WorldPhase>, record: Record) -> anyhow::Result<()> {
        let slot = usize::from(record.u8("slot").context("missing slot")?);
        let Account(account_id) = *session.attachment::<Account>().context("no account on session")?;

        let characters = self.0.backend.characters(account_id).await?;
        let character = characters
            .get(slot)
            .filter(|_| slot < CHARACTER_SLOTS)
            .cloned()
            .with_context(|| format!("slot {slot} is empty"))?;
        let at = self.0.backend.position(character.id).await?;

        session.advance(WorldPhase::Loading)?;
        let now = session.server_time();
        let day_start = now - now % GAME_DAY_MS;
        session.send(
            &self.0.schemas.world_load,
            Record::new()
                .with("character_id", character.id)
                .with("map", at.map)
                .with("x", at.x)
                .with("y", at.y)
                .with("server_time", session.to_client_time(now))
                .with("day_start", session.to_client_time(day_start)),
        )?;
        tracing::info!("[world] [select] id={} character={}", session.id(), character.name);
        session.attach(ActiveCharacter(character));
        Ok(())
    }
}

pub struct LoadingDone(Arc<World>);

#[async_trait]
impl Handler<WorldPhase> for LoadingDone {
    async fn handle(&self, session: &mut Session<WorldPhase>, _record: Record) -> anyhow::Result<()> {
        session.advance(WorldPhase::Game)?;
        self.0.chat.join(session.handle());
        Ok(())
    }
}

pub struct Chat(Arc<World>);

#[async_trait]
impl Handler<WorldPhase> for Chat {
    async fn handle(&self, session: &mut Session<WorldPhase>, record: Record) -> anyhow::Result<()> {
        let text = record.str("text").context("missing text")?;
        let ActiveCharacter(character) = session
            .attachment::<ActiveCharacter>()
            .context("no character on session")?;

        let line = Record::new()
            .with("speaker", clip(&character.name, NAME_LEN))
            .with("text", clip(text, MAX_CHAT_LEN));
        let reached = self.0.chat.broadcast(&self.0.schemas.chat_out, &line);
        tracing::debug!("[world] [chat] id={} reached={}", session.id(), reached);
        Ok(())
    }
}

pub struct ShopBuy(Arc<World>);

#[async_trait]
impl Handler<WorldPhase> for ShopBuy {
    async fn handle(&self, session: &mut Session<WorldPhase>, record: Record) -> anyhow::Result<()> {
        let shop_id = record.u32("shop_id").context("missing shop_id")?;
        let item_id = record.u32("item_id").context("missing item_id")?;
        let count = record.u16("count").context("missing count")?;
        let character_id = session
            .attachment::<ActiveCharacter>()
            .map(|c| c.0.id)
            .context("no character on session")?;

        let s = &self.0.schemas;
        match self.0.backend.buy(character_id, shop_id, item_id, count).await? {
            Purchase::Bought { gold_left } => {
                tracing::debug!("[world] [shop] id={} bought item={} x{} gold_left={}", session.id(), item_id, count, gold_left);
                let items = self.0.backend.shop_items(shop_id).await?;
                session.send(&s.shop_open, Record::new().with("items", shop_listing(&items)))?;
            }
            Purchase::NotEnoughMoney => {
                session.send(&s.shop_not_enough_money, Record::new().with("message", "Not enough money."))?;
            }
            Purchase::NoSpaceLeft => {
                session.send(&s.shop_no_space_left, Record::new().with("message", "No space left."))?;
            }
        }
        Ok(())
    }
}

pub struct Ping(Arc<World>);

#[async_trait]
impl Handler<WorldPhase> for Ping {
    async fn handle(&self, session: &mut Session<WorldPhase>, record: Record) -> anyhow::Result<()> {
        let client_time = record.u32("client_time").context("missing client_time")?;
        let server_time = session.to_client_time(session.server_time());
        session.send(
            &self.0.schemas.pong,
            Record::new().with("client_time", client_time).with("server_time", server_time),
        )?;
        Ok(())
    }
}
