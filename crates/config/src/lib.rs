//! Configuration module for mkv2cast
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation before any pipeline work starts.

pub mod config;

pub use config::*;
