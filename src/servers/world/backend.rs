//! Game data contract consumed by the world handlers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterSummary {
    pub id: u32,
    pub name: String,
    pub level: u16,
    pub class: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub map: u16,
    pub x: u16,
    pub y: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShopItem {
    pub item_id: u32,
    pub price: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purchase {
    Bought { gold_left: u32 },
    NotEnoughMoney,
    NoSpaceLeft,
}

#[async_trait]
pub trait WorldBackend: Send + Sync + 'static {
    /// Consume a ticket issued by the auth gateway.
    async fn redeem_ticket(&self, account_id: u32, ticket: u32) -> anyhow::Result<bool>;

    async fn characters(&self, account_id: u32) -> anyhow::Result<Vec<CharacterSummary>>;

    async fn position(&self, character_id: u32) -> anyhow::Result<Position>;

    async fn shop_items(&self, shop_id: u32) -> anyhow::Result<Vec<ShopItem>>;

    async fn buy(&self, character_id: u32, shop_id: u32, item_id: u32, count: u16) -> anyhow::Result<Purchase>;
}

#[derive(Default)]
struct WorldData {
    tickets: HashMap<u32, u32>,
    characters: HashMap<u32, Vec<CharacterSummary>>,
    positions: HashMap<u32, Position>,
    shops: HashMap<u32, Vec<ShopItem>>,
    gold: HashMap<u32, u32>,
    /// Items held per character
    inventory: HashMap<u32, usize>,
}

/// Everything in one mutex. Good enough for a single host and for tests.
pub struct MemoryWorld {
    data: Mutex<WorldData>,
    inventory_slots: usize,
    accept_any_ticket: bool,
}

impl MemoryWorld {
    pub fn new(inventory_slots: usize) -> Self {
        Self {
            data: Mutex::new(WorldData::default()),
            inventory_slots,
            accept_any_ticket: false,
        }
    }

    /// Development mode: every ticket redeems.
    pub fn accept_any_ticket(mut self) -> Self {
        self.accept_any_ticket = true;
        self
    }

    pub fn add_ticket(&self, account_id: u32, ticket: u32) {
        self.lock().tickets.insert(account_id, ticket);
    }

    pub fn add_character(&self, account_id: u32, character: CharacterSummary, at: Position, gold: u32) {
        let mut data = self.lock();
        data.positions.insert(character.id, at);
        data.gold.insert(character.id, gold);
        data.characters.entry(account_id).or_default().push(character);
    }

    pub fn add_shop(&self, shop_id: u32, items: Vec<ShopItem>) {
        self.lock().shops.insert(shop_id, items);
    }

    pub fn gold(&self, character_id: u32) -> u32 {
        self.lock().gold.get(&character_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, WorldData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WorldBackend for MemoryWorld {
    async fn redeem_ticket(&self, account_id: u32, ticket: u32) -> anyhow::Result<bool> {
        if self.accept_any_ticket {
            return Ok(true);
        }
        let mut data = self.lock();
        if data.tickets.get(&account_id) != Some(&ticket) {
            return Ok(false);
        }
        data.tickets.remove(&account_id);
        Ok(true)
    }

    async fn characters(&self, account_id: u32) -> anyhow::Result<Vec<CharacterSummary>> {
        Ok(self.lock().characters.get(&account_id).cloned().unwrap_or_default())
    }

    async fn position(&self, character_id: u32) -> anyhow::Result<Position> {
        Ok(self.lock().positions.get(&character_id).copied().unwrap_or_default())
    }

    async fn shop_items(&self, shop_id: u32) -> anyhow::Result<Vec<ShopItem>> {
        self.lock()
            .shops
            .get(&shop_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no shop {shop_id}"))
    }

    async fn buy(&self, character_id: u32, shop_id: u32, item_id: u32, count: u16) -> anyhow::Result<Purchase> {
        let mut data = self.lock();
        let item = data
            .shops
            .get(&shop_id)
            .and_then(|items| items.iter().find(|i| i.item_id == item_id).copied())
            .ok_or_else(|| anyhow::anyhow!("shop {shop_id} does not sell {item_id}"))?;

        let cost = u64::from(item.price) * u64::from(count);
        let gold = u64::from(data.gold.get(&character_id).copied().unwrap_or(0));
        if cost > gold {
            return Ok(Purchase::NotEnoughMoney);
        }
        let held = data.inventory.get(&character_id).copied().unwrap_or(0);
        if held + usize::from(count) > self.inventory_slots {
            return Ok(Purchase::NoSpaceLeft);
        }

        let gold_left = (gold - cost) as u32;
        data.gold.insert(character_id, gold_left);
        data.inventory.insert(character_id, held + usize::from(count));
        Ok(Purchase::Bought { gold_left })
    }
}
