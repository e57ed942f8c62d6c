//! Cross-component integration scenarios.

pub mod support;

#[cfg(test)]
mod e2e_flow;
#[cfg(test)]
mod replication;
#[cfg(test)]
mod streaming;
#[cfg(test)]
mod websocket;
