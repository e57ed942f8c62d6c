//! # Nexus Gateway - Transport Boundary
//!
//! What the core exposes to sockets: `ingest` for client messages and a
//! [`DeliverySink`] callback for pushing entity events to one connection.
//! The core never assumes a socket is alive beyond what the socket layer
//! reports through `connect` and `disconnect`.
//!
//! The [`ws`] module is the axum WebSocket layer built on that boundary.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod connection;
pub mod gateway;
pub mod ws;

pub use config::{GatewayConfig, WebSocketConfig};
pub use connection::{guest_id, ConnectionContext, GUEST_PREFIX};
pub use gateway::{
    ConnectionHandle, DeliverySink, GatewayStats, IngestAck, TransportGateway, GATEWAY_SOURCE,
};
pub use ws::{error_frame, routes};
