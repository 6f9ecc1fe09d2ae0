//! Deferred-event scheduler
//!
//! One instance per process, owned by the host and handed out as
//! `Arc<Scheduler>`. The host loop calls [`Scheduler::tick`] once per step;
//! every other thread only enqueues and cancels.
//!
//! A tick holds the event table for its whole sweep, so `enqueue`/`cancel`
//! from other threads wait for it to finish: once `cancel` returns the
//! callback will not run again. Calls made by a callback itself (on the
//! sweeping thread) go to a small inbox that is folded in after the sweep.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Callback type. The returned duration re-arms the event; `Duration::ZERO`
/// removes it.
pub type EventCallback = Box<dyn FnMut() -> Duration + Send + 'static>;

/// Opaque handle for a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Event {
    remaining: Duration,
    callback: EventCallback,
}

#[derive(Default)]
struct Inbox {
    added: Vec<(EventId, Event)>,
    cancelled: HashSet<EventId>,
}

/// Process-wide table of timed callbacks.
pub struct Scheduler {
    next_id: AtomicU64,
    events: Mutex<BTreeMap<EventId, Event>>,
    inbox: Mutex<Inbox>,
    /// Thread running the current sweep, if any.
    sweeper: Mutex<Option<ThreadId>>,
    /// Table size when the current sweep started.
    sweep_len: AtomicUsize,
}

/// Clears the sweeper mark even if a callback panics.
struct SweepGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            events: Mutex::new(BTreeMap::new()),
            inbox: Mutex::new(Inbox::default()),
            sweeper: Mutex::new(None),
            sweep_len: AtomicUsize::new(0),
        }
    }

    /// Schedule `callback` to run once `initial_delay` has elapsed.
    pub fn enqueue<F>(&self, callback: F, initial_delay: Duration) -> EventId
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = Event {
            remaining: initial_delay,
            callback: Box::new(callback),
        };
        if self.in_sweep() {
            lock(&self.inbox).added.push((id, event));
        } else {
            lock(&self.events).insert(id, event);
        }
        tracing::trace!("[timer] [enqueue] id={} delay_ms={}", id, initial_delay.as_millis());
        id
    }

    /// Remove an event. Unknown or already-finished ids are ignored.
    ///
    /// Waits for a tick in progress on another thread, so the callback never
    /// runs after this returns.
    pub fn cancel(&self, id: EventId) {
        if self.in_sweep() {
            let mut inbox = lock(&self.inbox);
            if let Some(pos) = inbox.added.iter().position(|(queued, _)| *queued == id) {
                inbox.added.swap_remove(pos);
            } else {
                inbox.cancelled.insert(id);
            }
            return;
        }
        if lock(&self.events).remove(&id).is_some() {
            tracing::trace!("[timer] [cancel] id={}", id);
        }
    }

    /// Advance every pending event by `elapsed` and fire the ones that are due.
    ///
    /// Must only be called from the host loop; concurrent ticks serialize on
    /// the table lock.
    pub fn tick(&self, elapsed: Duration) {
        let mut events = lock(&self.events);
        self.sweep_len.store(events.len(), Ordering::Relaxed);
        *lock(&self.sweeper) = Some(thread::current().id());
        let guard = SweepGuard(&self.sweeper);

        let mut finished = Vec::new();
        for (id, event) in events.iter_mut() {
            event.remaining = event.remaining.saturating_sub(elapsed);
            if !event.remaining.is_zero() {
                continue;
            }
            // Cancelled by an earlier callback in this sweep.
            if lock(&self.inbox).cancelled.contains(id) {
                continue;
            }
            let next = (event.callback)();
            if next.is_zero() {
                finished.push(*id);
            } else {
                event.remaining = next;
            }
        }
        drop(guard);

        for id in finished {
            events.remove(&id);
        }
        self.drain_inbox(&mut events);
    }

    /// Number of live events.
    ///
    /// From inside a callback this is computed from the table size at the
    /// start of the sweep plus what callbacks have queued or cancelled since.
    pub fn pending(&self) -> usize {
        if self.in_sweep() {
            let inbox = lock(&self.inbox);
            return (self.sweep_len.load(Ordering::Relaxed) + inbox.added.len())
                .saturating_sub(inbox.cancelled.len());
        }
        lock(&self.events).len()
    }

    fn in_sweep(&self) -> bool {
        *lock(&self.sweeper) == Some(thread::current().id())
    }

    fn drain_inbox(&self, events: &mut BTreeMap<EventId, Event>) {
        let mut inbox = lock(&self.inbox);
        for (id, event) in inbox.added.drain(..) {
            events.insert(id, event);
        }
        for id in inbox.cancelled.drain() {
            if events.remove(&id).is_some() {
                tracing::trace!("[timer] [cancel] id={}", id);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    #[test]
    fn test_reschedule_then_remove() {
        let sched = Scheduler::new();
        let (fired, seen) = counter();
        sched.enqueue(
            move || {
                let n = fired.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Duration::from_secs(3)
                } else {
                    Duration::ZERO
                }
            },
            Duration::from_secs(5),
        );

        sched.tick(Duration::from_secs(5));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sched.pending(), 1);

        sched.tick(Duration::from_secs(3));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(sched.pending(), 0);

        sched.tick(Duration::from_secs(100));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_not_due_does_not_fire() {
        let sched = Scheduler::new();
        let (fired, seen) = counter();
        sched.enqueue(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Duration::ZERO
            },
            Duration::from_millis(100),
        );
        sched.tick(Duration::from_millis(60));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        sched.tick(Duration::from_millis(40));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let sched = Scheduler::new();
        let (fired, seen) = counter();
        let id = sched.enqueue(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Duration::from_secs(1)
            },
            Duration::from_secs(1),
        );
        sched.tick(Duration::ZERO);
        sched.cancel(id);
        sched.cancel(id);
        sched.tick(Duration::from_secs(10));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_cancel_after_auto_removal_is_noop() {
        let sched = Scheduler::new();
        let (fired, seen) = counter();
        let id = sched.enqueue(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Duration::ZERO
            },
            Duration::ZERO,
        );
        sched.tick(Duration::ZERO);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        sched.cancel(id);
        sched.cancel(EventId(9999));
        sched.tick(Duration::from_secs(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_first_tick() {
        let sched = Scheduler::new();
        let (fired, seen) = counter();
        let id = sched.enqueue(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Duration::ZERO
            },
            Duration::ZERO,
        );
        sched.cancel(id);
        sched.tick(Duration::from_secs(1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_can_enqueue_and_cancel() {
        let sched = Arc::new(Scheduler::new());
        let (fired, seen) = counter();
        let inner = sched.clone();
        sched.enqueue(
            move || {
                let fired = fired.clone();
                inner.enqueue(
                    move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                        Duration::ZERO
                    },
                    Duration::from_millis(10),
                );
                Duration::ZERO
            },
            Duration::ZERO,
        );
        sched.tick(Duration::ZERO);
        assert_eq!(sched.pending(), 1);
        sched.tick(Duration::from_millis(10));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let sched = Scheduler::new();
        let a = sched.enqueue(|| Duration::ZERO, Duration::ZERO);
        let b = sched.enqueue(|| Duration::ZERO, Duration::ZERO);
        assert!(b.get() > a.get());
    }

    #[test]
    fn test_enqueue_from_other_threads() {
        let sched = Arc::new(Scheduler::new());
        let (fired, seen) = counter();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = sched.clone();
                let f = fired.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let f = f.clone();
                        s.enqueue(
                            move || {
                                f.fetch_add(1, Ordering::SeqCst);
                                Duration::ZERO
                            },
                            Duration::from_millis(1),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        sched.tick(Duration::from_millis(1));
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_cancel_waits_for_running_sweep() {
        use std::sync::atomic::AtomicBool;
        use std::sync::mpsc;

        let sched = Arc::new(Scheduler::new());
        let (started_tx, started_rx) = mpsc::channel();
        let sweep_done = Arc::new(AtomicBool::new(false));

        let done = sweep_done.clone();
        sched.enqueue(
            move || {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(200));
                done.store(true, Ordering::SeqCst);
                Duration::ZERO
            },
            Duration::ZERO,
        );
        let (fired, seen) = counter();
        let b = sched.enqueue(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Duration::from_millis(1)
            },
            Duration::ZERO,
        );

        let ticker = {
            let sched = sched.clone();
            std::thread::spawn(move || sched.tick(Duration::ZERO))
        };
        started_rx.recv().unwrap();
        sched.cancel(b);
        assert!(sweep_done.load(Ordering::SeqCst), "cancel returned mid-sweep");
        let fired_at_cancel = seen.load(Ordering::SeqCst);

        ticker.join().unwrap();
        sched.tick(Duration::from_secs(1));
        assert_eq!(seen.load(Ordering::SeqCst), fired_at_cancel);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_cancel_from_callback_skips_later_event() {
        let sched = Arc::new(Scheduler::new());
        let (fired, seen) = counter();
        let later = Arc::new(Mutex::new(None::<EventId>));

        let inner = sched.clone();
        let target = later.clone();
        sched.enqueue(
            move || {
                if let Some(id) = *lock(&target) {
                    inner.cancel(id);
                }
                Duration::ZERO
            },
            Duration::ZERO,
        );
        let id = sched.enqueue(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                Duration::ZERO
            },
            Duration::ZERO,
        );
        *lock(&later) = Some(id);

        sched.tick(Duration::ZERO);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_pending_from_callback() {
        let sched = Arc::new(Scheduler::new());
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let inner = sched.clone();
        sched.enqueue(|| Duration::from_secs(5), Duration::from_secs(5));
        sched.enqueue(
            move || {
                inner.enqueue(|| Duration::ZERO, Duration::from_secs(1));
                let _ = seen_tx.send(inner.pending());
                Duration::ZERO
            },
            Duration::ZERO,
        );
        sched.tick(Duration::ZERO);
        assert_eq!(seen_rx.recv().unwrap(), 3);
        assert_eq!(sched.pending(), 2);
    }
}
