//! Printer connection lifecycle

pub mod backoff;
pub mod health;
pub mod manager;
pub mod power;
pub mod transport;

pub use manager::{ConnectionEvent, ConnectionManager, ConnectionState, Discovery, Outbound};
