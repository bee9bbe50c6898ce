//! Crealink Library
//!
//! Local WebSocket bridge for Creality K-series and Ender V3 printers.

pub mod app;
pub mod connection;
pub mod device;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod model;
pub mod protocol;
pub mod scanner;
pub mod server;
pub mod storage;
pub mod utils;
