//! # relay-settings
//!
//! Layered configuration: compiled defaults, then `~/.relay/settings.json`
//! (deep-merged), then `RELAY_*` environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, parse_tool_list, relay_home, settings_path,
};
pub use types::{ApiKey, RelaySettings, DEFAULT_ALLOWED_TOOLS, DEFAULT_DISALLOWED_TOOLS};
