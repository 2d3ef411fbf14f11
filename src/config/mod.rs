//! Configuration module.
//!
//! Provides [`BeamformerConfig`] (top-level settings), one sub-config per
//! concern, [`AppPaths`] for cross-platform directories, and TOML persistence
//! via `BeamformerConfig::load` / `BeamformerConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    ArrayConfig, AudioConfig, BeamformerConfig, CombineMode, ConfigError, DeviceConfig,
    DoaMethod, LogConfig, ProcessingConfig, RecoveryConfig,
};
