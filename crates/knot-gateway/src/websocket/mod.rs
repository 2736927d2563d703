//! WebSocket transport: the [`Connection`](crate::connection::Connection)
//! adapter and the upgrade handler.

pub mod connection;
pub mod handler;
