//! # Component Container
//!
//! Holds every component instance of a node with its configuration.
//!
//! - Components are built in dependency order and shut down in reverse
//! - Handlers communicate with components through the bus and the sink only

pub mod components;
pub mod config;

pub use components::{builtin_catalog, NexusContainer};
pub use config::{ConfigError, HttpConfig, NodeConfig};
