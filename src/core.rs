//! Server clock, process lifecycle and the host loop that drives the
//! shared scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::timer::Scheduler;

/// Host loop step when the config does not set `tick_ms`.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Millisecond tick counter starting at process (or clock) creation.
///
/// Wraps after about 49.7 days; everything reading it treats values modulo 2^32.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    started: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Run once when the host stops.
pub type TermFunc = Box<dyn Fn() + Send + 'static>;

/// Process lifecycle state
pub struct ServerState {
    shutdown_requested: AtomicBool,
    term_funcs: Mutex<Vec<TermFunc>>,
}

impl ServerState {
    pub fn new() -> Self {
        ServerState {
            shutdown_requested: AtomicBool::new(false),
            term_funcs: Mutex::new(Vec::new()),
        }
    }

    /// Request server shutdown
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            tracing::info!("[core] shutdown requested");
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Add a termination callback
    pub fn set_term_func<F>(&self, func: F)
    where
        F: Fn() + Send + 'static,
    {
        self.term_funcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(func));
    }

    /// Run the termination callbacks, newest first. Each runs at most once.
    pub fn call_term_func(&self) {
        let funcs = std::mem::take(&mut *self.term_funcs.lock().unwrap_or_else(PoisonError::into_inner));
        for func in funcs.iter().rev() {
            func();
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedServerState = Arc<ServerState>;

pub fn create_server_state() -> SharedServerState {
    Arc::new(ServerState::new())
}

/// Tick `scheduler` every `tick_rate` with the real elapsed time until
/// shutdown is requested.
pub async fn run_host_loop(scheduler: Arc<Scheduler>, tick_rate: Duration, state: SharedServerState) {
    let mut interval = tokio::time::interval(tick_rate);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = Instant::now();

    tracing::debug!("[core] host loop running, tick={}ms", tick_rate.as_millis());
    while !state.should_shutdown() {
        interval.tick().await;
        let now = Instant::now();
        scheduler.tick(now.duration_since(last));
        last = now;
    }
    tracing::debug!("[core] host loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_server_state_shutdown() {
        let state = ServerState::new();
        assert!(!state.should_shutdown());

        state.request_shutdown();
        assert!(state.should_shutdown());
    }

    #[test]
    fn test_term_funcs_run_once_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let state = ServerState::new();
        for i in 0..3 {
            let order = order.clone();
            state.set_term_func(move || order.lock().unwrap().push(i));
        }

        state.call_term_func();
        state.call_term_func();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = ServerClock::new();
        let a = clock.now_ms();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now_ms() >= a + 5);
    }

    #[tokio::test]
    async fn test_host_loop_fires_events_and_stops() {
        let scheduler = Arc::new(Scheduler::new());
        let state = create_server_state();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let s = state.clone();
        scheduler.enqueue(
            move || {
                if f.fetch_add(1, Ordering::SeqCst) == 2 {
                    s.request_shutdown();
                    return Duration::ZERO;
                }
                Duration::from_millis(5)
            },
            Duration::from_millis(5),
        );

        tokio::time::timeout(Duration::from_secs(5), run_host_loop(scheduler, Duration::from_millis(1), state))
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_default_tick_feeds_config() {
        let config = crate::config::ServerConfig::default();
        assert_eq!(config.tick(), DEFAULT_TICK);
    }
}
