//! # Nexus Test Suite
//!
//! Unified test crate for scenarios that span several components.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── support.rs      # node fixtures and recording delivery sinks
//!     ├── e2e_flow.rs     # request → started → state → success
//!     ├── replication.rs  # two nodes sharing one transport
//!     ├── streaming.rs    # stream sessions seen by connected clients
//!     └── websocket.rs    # real sockets against a served node
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p nexus-tests
//! cargo test -p nexus-tests integration::replication::
//! ```

#![allow(dead_code)]

pub mod integration;
