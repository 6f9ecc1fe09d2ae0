//! Authentication gateway
//!
//! One phase, one request: the client sends its credentials, the gateway
//! answers with a failure status (and waits for another try) or with the
//! account id and a one-time ticket, then closes.

pub mod packet;
pub mod store;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::dispatch::{Handler, Registry, RegistryBuilder};
use crate::packet::{CodecError, PacketSchema, Record};
use crate::session::{Phases, Session};

pub use packet::LoginStatus;
pub use store::{AccountRecord, AccountStore, MemoryAccountStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthPhase {
    Auth,
}

impl Phases for AuthPhase {
    fn entry() -> Self {
        AuthPhase::Auth
    }

    fn can_advance_to(self, _next: Self) -> bool {
        false
    }

    fn code(self) -> u8 {
        0
    }
}

/// Key material the client sent with its login request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptKey(pub [u32; 4]);

/// Build the gateway's dispatch table.
pub fn registry(store: Arc<dyn AccountStore>) -> Result<Registry<AuthPhase>, CodecError> {
    let failure = packet::login_failure()?;
    let success = packet::login_success()?;
    let handler = Arc::new(LoginHandler {
        store,
        failure: failure.clone(),
        success: success.clone(),
    });

    RegistryBuilder::new()
        .register_in(packet::login_request()?, handler, &[AuthPhase::Auth])
        .declare(failure)
        .declare(success)
        .build()
}

pub struct LoginHandler {
    store: Arc<dyn AccountStore>,
    failure: Arc<PacketSchema>,
    success: Arc<PacketSchema>,
}

impl LoginHandler {
    async fn authenticate(&self, username: &str, password: String) -> Result<u32, LoginStatus> {
        let account = match self.store.find(username).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(LoginStatus::NoUser),
            Err(e) => {
                tracing::warn!("[auth] [login] account lookup failed user={}: {:#}", username, e);
                return Err(LoginStatus::ServerError);
            }
        };
        if account.banned {
            return Err(LoginStatus::Banned);
        }

        let hash = account.password_hash;
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await;
        match verified {
            Ok(Ok(true)) => Ok(account.account_id),
            Ok(Ok(false)) => Err(LoginStatus::WrongPassword),
            Ok(Err(e)) => {
                tracing::warn!("[auth] [login] bad password hash user={}: {}", username, e);
                Err(LoginStatus::ServerError)
            }
            Err(e) => {
                tracing::error!("[auth] [login] verify task failed: {}", e);
                Err(LoginStatus::ServerError)
            }
        }
    }
}

#[async_trait]
impl Handler<AuthPhase> for LoginHandler {
    async fn handle(&self, session: &mut Session<AuthPhase>, record: Record) -> anyhow::Result<()> {
        let username = record.str("username").context("missing username")?.to_string();
        let password = record.str("password").context("missing password")?.to_string();
        if let Some(key) = record.array("encrypt_key") {
            let mut words = [0u32; 4];
            for (w, v) in words.iter_mut().zip(key) {
                *w = v.as_int().and_then(|n| u32::try_from(n).ok()).unwrap_or(0);
            }
            session.attach(EncryptKey(words));
        }

        let account_id = match self.authenticate(&username, password).await {
            Ok(id) => id,
            Err(status) => {
                tracing::info!(
                    "[auth] [login] refused id={} user={} status={}",
                    session.id(),
                    username,
                    status.as_str()
                );
                session.send(&self.failure, Record::new().with("status", status.as_str()))?;
                return Ok(());
            }
        };

        let ticket = rand::random::<u32>();
        if let Err(e) = self.store.issue_ticket(account_id, ticket).await {
            session.send(&self.failure, Record::new().with("status", LoginStatus::ServerError.as_str()))?;
            return Err(e.context("issue ticket"));
        }

        tracing::info!(
            "[auth] [login] ok id={} user={} account={}",
            session.id(),
            username,
            account_id
        );
        session.send(
            &self.success,
            Record::new().with("account_id", account_id).with("ticket", ticket),
        )?;
        session.close();
        Ok(())
    }
}
