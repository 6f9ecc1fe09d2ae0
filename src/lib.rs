//! Realmnet - game server network core
//!
//! Typed binary packets, per-connection session state machines, handler
//! dispatch and a shared deferred-event scheduler, plus the auth gateway and
//! world processes built on them.

// ============================================
// Wire format
// ============================================

/// Packet schemas, values and the codec
pub mod packet;

// ============================================
// Connection core
// ============================================

/// Handler registry and frame dispatch
pub mod dispatch;
/// Observation hooks around encode/decode
pub mod hooks;
/// Per-connection state machine and session table
pub mod session;
/// Deferred-event scheduler
pub mod timer;

// ============================================
// Hosting
// ============================================

/// Server configuration (YAML)
pub mod config;
/// Server clock, lifecycle state and the host tick loop
pub mod core;
/// Accept loop, access lists, throttling
pub mod network;
/// Server implementations (auth, world)
pub mod servers;
