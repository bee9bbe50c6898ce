//! Per-printer device runtime

pub mod dispatcher;
pub mod machine;
pub mod media;
pub mod publisher;
pub mod registry;
pub mod runtime;

pub use dispatcher::{Ack, Command, Material};
pub use machine::{DeviceView, Lifecycle};
pub use registry::DeviceRegistry;
pub use runtime::{DeviceConfig, DeviceHandle, DeviceServices};
