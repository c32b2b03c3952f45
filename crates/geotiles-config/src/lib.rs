//! Configuration for tileset streaming.
//!
//! Provides level-of-detail, memory budget, and streaming settings that persist
//! to disk as RON files, with validation, CLI overrides via clap, and hot-reload
//! detection.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, StreamingConfig, TilesetConfig};
pub use error::ConfigError;
