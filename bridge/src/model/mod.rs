//! Printer data model

pub mod capability;
pub mod identity;
pub mod status;
pub mod telemetry;
