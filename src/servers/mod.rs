//! Server process implementations
//!
//! The two processes:
//! - auth: Authentication gateway
//! - world: Character selection and the game world
//!
//! [`Host`] wires a protocol's registry into a listening process: shared
//! scheduler, hooks, access control, throttling and the tick loop.

pub mod auth;
pub mod world;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::core::{create_server_state, run_host_loop, SharedServerState};
use crate::dispatch::Registry;
use crate::hooks::{Hooks, PacketCounters, TracingObserver};
use crate::network::{ConnectThrottle, Server, ThrottleConfig};
use crate::session::{Phases, SessionContext, SessionLimits, SessionManager};
use crate::timer::Scheduler;

/// One listening process.
pub struct Host<P: Phases> {
    name: &'static str,
    tick: Duration,
    stats_interval: Duration,
    scheduler: Arc<Scheduler>,
    state: SharedServerState,
    counters: Arc<PacketCounters>,
    manager: Arc<SessionManager>,
    server: Server<P>,
}

impl<P: Phases> Host<P> {
    pub fn new(name: &'static str, config: &ServerConfig, registry: Registry<P>) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::new());
        let state = create_server_state();
        let counters = Arc::new(PacketCounters::new());
        let hooks = Hooks::new()
            .with(Arc::new(TracingObserver))
            .with(counters.clone());

        let ctx = SessionContext::new(Arc::new(registry), scheduler.clone())
            .with_hooks(hooks)
            .with_limits(SessionLimits::from(config));

        let throttle = Arc::new(ConnectThrottle::new(ThrottleConfig::from(config)));
        throttle.schedule_pruning(&scheduler);

        let manager = Arc::new(SessionManager::new(config.max_sessions));
        let server = Server::new(name, Arc::new(ctx), state.clone())
            .with_manager(manager.clone())
            .with_access_list(config.access_list()?)
            .with_throttle(throttle);

        Ok(Self {
            name,
            tick: config.tick(),
            stats_interval: Duration::from_secs(config.stats_interval_secs),
            scheduler,
            state,
            counters,
            manager,
            server,
        })
    }

    pub fn state(&self) -> &SharedServerState {
        &self.state
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn counters(&self) -> &Arc<PacketCounters> {
        &self.counters
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Serve on `listener` until shutdown is requested through [`Host::state`].
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        if !self.stats_interval.is_zero() {
            let counters = self.counters.clone();
            let name = self.name;
            let every = self.stats_interval;
            self.scheduler.enqueue(
                move || {
                    counters.report(name);
                    every
                },
                every,
            );
        }

        let ticker = tokio::spawn(run_host_loop(self.scheduler.clone(), self.tick, self.state.clone()));
        let served = self.server.run(listener).await;

        self.state.request_shutdown();
        if let Err(e) = ticker.await {
            tracing::error!("[{}] host loop task failed: {}", self.name, e);
        }
        self.counters.report(self.name);
        self.state.call_term_func();
        tracing::info!("[{}] [stopped]", self.name);
        served
    }
}

/// Bind the configured address on `port`.
pub async fn bind(config: &ServerConfig, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.bind_ip, port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind {}", addr))
}

/// Request shutdown on Ctrl+C.
pub fn shutdown_on_ctrl_c(state: SharedServerState) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => state.request_shutdown(),
            Err(e) => tracing::error!("[core] cannot listen for Ctrl+C: {}", e),
        }
    });
}

/// Install the process-wide tracing subscriber.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Parse `[--conf FILE]`. Returns `None` when the process should exit
/// (help was printed or the arguments were bad).
pub fn parse_conf_arg(program: &str) -> Option<String> {
    let mut conf_file = "conf/server.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: {} [--conf FILE]", program);
                return None;
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return None;
                }
            }
            other => eprintln!("Warning: ignoring unknown argument {}", other),
        }
        i += 1;
    }
    Some(conf_file)
}
