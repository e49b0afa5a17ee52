//! Core types shared across shardbridge crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Configuration management with TOML support

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BridgeConfig, ConversionConfig, ParallelConfig};
pub use error::{Result, ShardBridgeError};
