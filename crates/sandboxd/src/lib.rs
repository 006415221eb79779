//! Sandbox lifecycle manager: provisions ephemeral, resource-bounded,
//! network-isolated code-execution containers and runs jobs inside them.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod governor;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod store;
