//! # knot-core
//!
//! Foundation types shared by every knot crate:
//!
//! - **Branded IDs**: `TeamId`, `UserId`, `ConnectionId` as newtypes for type safety
//! - **Errors**: `GatewayError` hierarchy via `thiserror`
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::{GatewayError, HandshakeError, Result, SendError, TransportError};
pub use ids::{ConnectionId, TeamId, UserId};
