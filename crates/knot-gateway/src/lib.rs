//! # knot-gateway
//!
//! Session-and-delivery core of a WebSocket gateway that groups connections
//! by team and fans messages out to every member of a team.
//!
//! - [`session::Session`]: one connection, a bounded outbound queue and its delivery loop
//! - [`group::Group`]: the sessions of one team, keyed by user
//! - [`registry::Registry`]: team → group and connection → session directory
//! - [`broadcaster`]: one periodic fan-out task per live group
//! - [`shutdown::ShutdownCoordinator`]: bounded graceful shutdown
//! - [`server::GatewayServer`]: Axum listener with the `WebSocket` upgrade,
//!   `/health` and `/metrics` endpoints
//!
//! Lock order is always registry before group. No lock is held across an
//! `.await`, so a slow peer never blocks registry operations.

#![deny(unsafe_code)]

pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod group;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod testing;
pub mod websocket;

pub use connection::Connection;
pub use group::Group;
pub use registry::Registry;
pub use session::{Session, SessionExit};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
