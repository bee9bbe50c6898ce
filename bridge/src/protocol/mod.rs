//! Printer WebSocket protocol

pub mod frame;
pub mod message;

/// Default telemetry WebSocket port
pub const DEFAULT_WS_PORT: u16 = 9999;
