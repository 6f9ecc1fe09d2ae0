//! TCP accept loop wiring sockets to sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use super::acl::AccessList;
use super::throttle::ConnectThrottle;
use crate::core::SharedServerState;
use crate::session::{CloseReason, Phases, Session, SessionContext, SessionManager};

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// How long shutdown waits for sessions to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server<P: Phases> {
    name: &'static str,
    ctx: Arc<SessionContext<P>>,
    manager: Arc<SessionManager>,
    acl: Arc<AccessList>,
    throttle: Option<Arc<ConnectThrottle>>,
    state: SharedServerState,
}

impl<P: Phases> Server<P> {
    /// `name` tags every log line from this listener.
    pub fn new(name: &'static str, ctx: Arc<SessionContext<P>>, state: SharedServerState) -> Self {
        Self {
            name,
            ctx,
            manager: Arc::new(SessionManager::default()),
            acl: Arc::new(AccessList::open()),
            throttle: None,
            state,
        }
    }

    pub fn with_manager(mut self, manager: Arc<SessionManager>) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_access_list(mut self, acl: AccessList) -> Self {
        self.acl = Arc::new(acl);
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<ConnectThrottle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Accept connections until shutdown is requested, then close every
    /// session and wait for them to drain.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let name = self.name;
        tracing::info!("[{}] Listening on {}", name, listener.local_addr()?);

        loop {
            if self.state.should_shutdown() {
                tracing::info!("[{}] Shutdown requested", name);
                break;
            }

            match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((socket, addr))) => {
                    tracing::debug!("[{}] New connection from {}", name, addr);
                    tokio::spawn(handle_connection(
                        name,
                        socket,
                        addr,
                        self.ctx.clone(),
                        self.manager.clone(),
                        self.acl.clone(),
                        self.throttle.clone(),
                    ));
                }
                Ok(Err(e)) => {
                    tracing::error!("[{}] Accept error: {}", name, e);
                }
                Err(_) => {
                    // Timeout - check shutdown flag again
                    continue;
                }
            }
        }

        shutdown_all_sessions(name, &self.manager).await;
        Ok(())
    }
}

/// Ask every session to close and wait (bounded) for them to go.
async fn shutdown_all_sessions(name: &str, manager: &SessionManager) {
    let asked = manager.close_all(CloseReason::Shutdown).await;
    tracing::info!("[{}] Shutting down {} sessions", name, asked);

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while manager.count().await > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("[{}] {} sessions still open after drain timeout", name, manager.count().await);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handle a single client connection
async fn handle_connection<P: Phases>(
    name: &'static str,
    socket: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SessionContext<P>>,
    manager: Arc<SessionManager>,
    acl: Arc<AccessList>,
    throttle: Option<Arc<ConnectThrottle>>,
) {
    if !acl.permits(addr.ip()) {
        tracing::warn!("[{}] [acl] refused ip={}", name, addr.ip());
        return;
    }
    if let Some(throttle) = &throttle {
        if !throttle.check(addr.ip()) {
            tracing::warn!("[{}] [throttle] refused ip={}", name, addr.ip());
            return;
        }
    }

    let id = manager.allocate_id();
    let session = Session::new(id, addr, ctx);
    if let Err(e) = manager.insert(session.handle()).await {
        tracing::error!("[{}] Failed to insert session: {}", name, e);
        return;
    }
    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!("[{}] set_nodelay failed id={}: {}", name, id, e);
    }

    if let Err(e) = session.run(socket).await {
        tracing::debug!("[{}] id={} ended: {}", name, id, e);
    }

    manager.remove(id).await;
}
