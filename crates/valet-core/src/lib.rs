//! valet-core — configuration shared by every Valet component.
//!
//! The [`ValetConfig`] is parsed once at process start and handed to each
//! component's constructor. Nothing reads it from a global.

pub mod config;

pub use config::{
    ConfigError, EngineConfig, InventoryConfig, LoggingConfig, OvercommitConfig, StoreConfig,
    ValetConfig,
};
