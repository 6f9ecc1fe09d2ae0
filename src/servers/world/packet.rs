//! World process wire schemas.

use std::sync::Arc;

use crate::packet::{CodecError, FieldKind, FieldSpec, IntWidth, PacketSchema};

// Client -> server
pub const ENTER_WORLD: u8 = 0x01;
pub const SELECT_CHARACTER: u8 = 0x03;
pub const LOADING_DONE: u8 = 0x05;
pub const CHAT: u8 = 0x0E;
pub const PING: u8 = 0x10;
pub const SHOP_BUY: u8 = 0x27;

// Server -> client
pub const CHARACTER_LIST: u8 = 0x02;
pub const WORLD_LOAD: u8 = 0x04;
pub const PONG: u8 = 0x10;
pub const SHOP: u8 = 0x26;

pub const SHOP_OPEN: u8 = 0x00;
pub const SHOP_NOT_ENOUGH_MONEY: u8 = 0x05;
pub const SHOP_NO_SPACE_LEFT: u8 = 0x07;

/// Character slots per account.
pub const CHARACTER_SLOTS: usize = 3;
pub const NAME_LEN: usize = 16;
/// Longest chat line the u8 size prefix can carry.
pub const MAX_CHAT_LEN: usize = u8::MAX as usize;

/// Bytes per entry in the shop-open item list: `item_id:u32, price:u32`.
pub const SHOP_ITEM_LEN: usize = 8;

/// The schemas a world process speaks, built once.
pub struct WorldSchemas {
    pub enter_world: Arc<PacketSchema>,
    pub select_character: Arc<PacketSchema>,
    pub loading_done: Arc<PacketSchema>,
    pub chat_in: Arc<PacketSchema>,
    pub shop_buy: Arc<PacketSchema>,
    pub ping: Arc<PacketSchema>,

    pub character_list: Arc<PacketSchema>,
    pub world_load: Arc<PacketSchema>,
    pub chat_out: Arc<PacketSchema>,
    pub pong: Arc<PacketSchema>,
    pub shop_open: Arc<PacketSchema>,
    pub shop_not_enough_money: Arc<PacketSchema>,
    pub shop_no_space_left: Arc<PacketSchema>,
}

impl WorldSchemas {
    pub fn build() -> Result<Self, CodecError> {
        Ok(Self {
            enter_world: PacketSchema::builder("enter_world", ENTER_WORLD)
                .incoming()
                .sequenced()
                .field(FieldSpec::u32("account_id"))
                .field(FieldSpec::u32("ticket"))
                .build()?,
            select_character: PacketSchema::builder("select_character", SELECT_CHARACTER)
                .incoming()
                .sequenced()
                .field(FieldSpec::u8("slot"))
                .build()?,
            loading_done: PacketSchema::builder("loading_done", LOADING_DONE)
                .incoming()
                .sequenced()
                .build()?,
            chat_in: PacketSchema::builder("chat_in", CHAT)
                .incoming()
                .sequenced()
                .field(FieldSpec::size("len", IntWidth::U8, "text"))
                .field(FieldSpec::text("text"))
                .build()?,
            shop_buy: PacketSchema::builder("shop_buy", SHOP_BUY)
                .incoming()
                .sequenced()
                .field(FieldSpec::u32("shop_id"))
                .field(FieldSpec::u32("item_id"))
                .field(FieldSpec::u16("count"))
                .build()?,
            ping: PacketSchema::builder("ping", PING)
                .incoming()
                .field(FieldSpec::u32("client_time"))
                .build()?,

            character_list: PacketSchema::builder("character_list", CHARACTER_LIST)
                .outgoing()
                .field(FieldSpec::u8("count"))
                .field(FieldSpec::array(
                    "characters",
                    FieldKind::Group(vec![
                        FieldSpec::u32("id"),
                        FieldSpec::string("name", NAME_LEN),
                        FieldSpec::u16("level"),
                        FieldSpec::u8("class"),
                    ]),
                    CHARACTER_SLOTS,
                ))
                .build()?,
            world_load: PacketSchema::builder("world_load", WORLD_LOAD)
                .outgoing()
                .field(FieldSpec::u32("character_id"))
                .field(FieldSpec::u16("map"))
                .field(FieldSpec::u16("x"))
                .field(FieldSpec::u16("y"))
                .field(FieldSpec::u32("server_time"))
                .field(FieldSpec::u32("day_start"))
                .build()?,
            chat_out: PacketSchema::builder("chat_out", CHAT)
                .outgoing()
                .sequenced()
                .field(FieldSpec::string("speaker", NAME_LEN))
                .field(FieldSpec::size("len", IntWidth::U8, "text"))
                .field(FieldSpec::text("text"))
                .build()?,
            pong: PacketSchema::builder("pong", PONG)
                .outgoing()
                .field(FieldSpec::u32("client_time"))
                .field(FieldSpec::u32("server_time"))
                .build()?,
            shop_open: PacketSchema::builder("shop_open", SHOP)
                .sub_header(SHOP_OPEN)
                .outgoing()
                .field(FieldSpec::size("len", IntWidth::U8, "items"))
                .field(FieldSpec::bytes("items"))
                .build()?,
            shop_not_enough_money: PacketSchema::builder("shop_not_enough_money", SHOP)
                .sub_header(SHOP_NOT_ENOUGH_MONEY)
                .outgoing()
                .field(FieldSpec::size("len", IntWidth::U8, "message"))
                .field(FieldSpec::text("message"))
                .build()?,
            shop_no_space_left: PacketSchema::builder("shop_no_space_left", SHOP)
                .sub_header(SHOP_NO_SPACE_LEFT)
                .outgoing()
                .field(FieldSpec::size("len", IntWidth::U8, "message"))
                .field(FieldSpec::text("message"))
                .build()?,
        })
    }
}

/// Cut `text` to at most `max` bytes without splitting a character.
pub fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
