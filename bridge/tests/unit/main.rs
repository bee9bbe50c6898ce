//! Integration tests

mod harness;
mod test_commands;
mod test_connection;
mod test_device;
mod test_registry;
