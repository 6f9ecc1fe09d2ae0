//! Observation hooks around decode and encode.
//!
//! Observers are advisory: they see frames through shared references only,
//! and an observer that fails (or panics) is logged and skipped so dispatch
//! carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::packet::{PacketSchema, Record};
use crate::session::SessionId;

/// What an observer learns about a frame without decoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub session: SessionId,
    pub header: u8,
    pub sub_header: Option<u8>,
    /// Encoded length in bytes, header included.
    pub len: usize,
}

/// Telemetry extension point. Every method defaults to a no-op.
pub trait Observer: Send + Sync + 'static {
    fn before_decode(&self, _frame: &FrameInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_decode(&self, _frame: &FrameInfo, _record: &Record) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_encode(&self, _session: SessionId, _schema: &PacketSchema, _record: &Record) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_encode(&self, _frame: &FrameInfo) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fan-out over the registered observers.
#[derive(Clone, Default)]
pub struct Hooks {
    observers: Vec<Arc<dyn Observer>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn before_decode(&self, frame: &FrameInfo) {
        self.each("before_decode", |o| o.before_decode(frame));
    }

    pub fn after_decode(&self, frame: &FrameInfo, record: &Record) {
        self.each("after_decode", |o| o.after_decode(frame, record));
    }

    pub fn before_encode(&self, session: SessionId, schema: &PacketSchema, record: &Record) {
        self.each("before_encode", |o| o.before_encode(session, schema, record));
    }

    pub fn after_encode(&self, frame: &FrameInfo) {
        self.each("after_encode", |o| o.after_encode(frame));
    }

    fn each<F>(&self, stage: &'static str, f: F)
    where
        F: Fn(&dyn Observer) -> anyhow::Result<()>,
    {
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("[hooks] [{stage}] observer failed: {e:#}"),
                Err(_) => tracing::warn!("[hooks] [{stage}] observer panicked"),
            }
        }
    }
}

/// Logs every frame at trace level.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn after_decode(&self, frame: &FrameInfo, record: &Record) -> anyhow::Result<()> {
        tracing::trace!(
            "[packet_in] session={} header={:02X} sub={:?} len={} {}",
            frame.session,
            frame.header,
            frame.sub_header,
            frame.len,
            record
        );
        Ok(())
    }

    fn after_encode(&self, frame: &FrameInfo) -> anyhow::Result<()> {
        tracing::trace!(
            "[packet_out] session={} header={:02X} sub={:?} len={}",
            frame.session,
            frame.header,
            frame.sub_header,
            frame.len
        );
        Ok(())
    }
}

/// Frame and byte counters per header, for each direction.
pub struct PacketCounters {
    frames_in: [AtomicU64; 256],
    bytes_in: [AtomicU64; 256],
    frames_out: [AtomicU64; 256],
    bytes_out: [AtomicU64; 256],
}

/// Snapshot of one header's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderStats {
    pub frames_in: u64,
    pub bytes_in: u64,
    pub frames_out: u64,
    pub bytes_out: u64,
}

impl PacketCounters {
    pub fn new() -> Self {
        Self {
            frames_in: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes_in: std::array::from_fn(|_| AtomicU64::new(0)),
            frames_out: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes_out: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn get(&self, header: u8) -> HeaderStats {
        let i = usize::from(header);
        HeaderStats {
            frames_in: self.frames_in[i].load(Ordering::Relaxed),
            bytes_in: self.bytes_in[i].load(Ordering::Relaxed),
            frames_out: self.frames_out[i].load(Ordering::Relaxed),
            bytes_out: self.bytes_out[i].load(Ordering::Relaxed),
        }
    }

    /// Totals over every header: (frames_in, bytes_in, frames_out, bytes_out).
    pub fn totals(&self) -> HeaderStats {
        (0..=u8::MAX).map(|h| self.get(h)).fold(HeaderStats::default(), |acc, s| HeaderStats {
            frames_in: acc.frames_in + s.frames_in,
            bytes_in: acc.bytes_in + s.bytes_in,
            frames_out: acc.frames_out + s.frames_out,
            bytes_out: acc.bytes_out + s.bytes_out,
        })
    }

    /// Log the totals. Meant to be driven by a scheduler event.
    pub fn report(&self, tag: &str) {
        let t = self.totals();
        tracing::info!(
            "[{tag}] [stats] frames_in={} bytes_in={} frames_out={} bytes_out={}",
            t.frames_in,
            t.bytes_in,
            t.frames_out,
            t.bytes_out
        );
    }
}

impl Default for PacketCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for PacketCounters {
    fn before_decode(&self, frame: &FrameInfo) -> anyhow::Result<()> {
        let i = usize::from(frame.header);
        self.frames_in[i].fetch_add(1, Ordering::Relaxed);
        self.bytes_in[i].fetch_add(frame.len as u64, Ordering::Relaxed);
        Ok(())
    }

    fn after_encode(&self, frame: &FrameInfo) -> anyhow::Result<()> {
        let i = usize::from(frame.header);
        self.frames_out[i].fetch_add(1, Ordering::Relaxed);
        self.bytes_out[i].fetch_add(frame.len as u64, Ordering::Relaxed);
        Ok(())
    }
}
