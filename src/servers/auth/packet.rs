//! Auth gateway wire schemas.

use std::sync::Arc;

use crate::packet::{CodecError, FieldKind, FieldSpec, IntWidth, PacketSchema};

pub const LOGIN_REQUEST: u8 = 0x6F;
pub const LOGIN_FAILURE: u8 = 0x07;
pub const LOGIN_SUCCESS: u8 = 0x08;

pub const USERNAME_LEN: usize = 31;
pub const PASSWORD_LEN: usize = 17;
pub const STATUS_LEN: usize = 9;

/// Status strings carried by the failure frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    WrongPassword,
    NoUser,
    Banned,
    ServerError,
}

impl LoginStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoginStatus::WrongPassword => "WRONGPWD",
            LoginStatus::NoUser => "NOUSER",
            LoginStatus::Banned => "BANNED",
            LoginStatus::ServerError => "ERRSERVER",
        }
    }
}

/// `username:fixedstring[31], password:fixedstring[17], encrypt_key:u32[4]` + sequence
pub fn login_request() -> Result<Arc<PacketSchema>, CodecError> {
    PacketSchema::builder("login_request", LOGIN_REQUEST)
        .incoming()
        .sequenced()
        .field(FieldSpec::string("username", USERNAME_LEN))
        .field(FieldSpec::string("password", PASSWORD_LEN))
        .field(FieldSpec::array("encrypt_key", FieldKind::Int(IntWidth::U32), 4))
        .build()
}

/// `status:fixedstring[9]`
pub fn login_failure() -> Result<Arc<PacketSchema>, CodecError> {
    PacketSchema::builder("login_failure", LOGIN_FAILURE)
        .outgoing()
        .field(FieldSpec::string("status", STATUS_LEN))
        .build()
}

/// `account_id:u32, ticket:u32`
pub fn login_success() -> Result<Arc<PacketSchema>, CodecError> {
    PacketSchema::builder("login_success", LOGIN_SUCCESS)
        .outgoing()
        .field(FieldSpec::u32("account_id"))
        .field(FieldSpec::u32("ticket"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode, encode, Record};

    #[test]
    fn test_login_request_size() {
        // header + 31 + 17 + 16 + sequence
        assert_eq!(login_request().unwrap().static_size(), Some(1 + 31 + 17 + 16 + 1));
    }

    #[test]
    fn test_failure_frame_bytes() {
        let schema = login_failure().unwrap();
        let bytes = encode(&schema, &Record::new().with("status", LoginStatus::WrongPassword.as_str()), None).unwrap();
        assert_eq!(&bytes[..], b"\x07WRONGPWD\x00");

        let bytes = encode(&schema, &Record::new().with("status", LoginStatus::ServerError.as_str()), None).unwrap();
        assert_eq!(&bytes[..], b"\x07ERRSERVER");
        assert_eq!(decode(&schema, &bytes).unwrap().record.str("status"), Some("ERRSERVER"));
    }
}
