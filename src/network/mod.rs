//! Listener plumbing: accept loop, access lists and connection throttling.

pub mod acl;
pub mod server;
pub mod throttle;

pub use acl::{AccessList, AclOrder};
pub use server::Server;
pub use throttle::{ConnectThrottle, ThrottleConfig};
