pub mod adb;
pub mod args;
pub mod config;
pub mod starter;

#[cfg(test)]
mod test_support;

pub use config::StarterConfig;
pub use starter::{BootstrapHandle, BootstrapState, StarterEvent, spawn_lifecycle};
