//! HTTP client for hosted agent engine resources.
//!
//! Provides:
//! - `EngineConfig` - Connection parameters from the environment
//! - Wire protocol types and stream line decoding
//! - `AgentEngineClient` - `RemoteAgent` over HTTPS

pub mod client;
pub mod config;
pub mod protocol;

pub use client::AgentEngineClient;
pub use config::{ConfigError, EngineConfig};
