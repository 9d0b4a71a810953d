//! Layered configuration for the quorum coordinator.
//!
//! 1. Compiled defaults ([`QuorumSettings::default()`])
//! 2. JSON file at `$QUORUM_CONFIG` or `./quorum.json`, deep-merged over defaults
//! 3. `QUORUM_*` environment variables

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    LoggingSettings, PoolSettings, QuorumSettings, RouterSettings, ServerSettings, SessionSettings,
    TransportMode, TransportSettings,
};
