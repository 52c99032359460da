//! # parley-settings
//!
//! Layered configuration for the parley orchestrator.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ParleySettings::default()`]
//! 2. **Settings file**: `~/.parley/settings.json`, deep-merged over defaults
//! 3. **Environment**: `PARLEY_*` overrides
//!
//! ```no_run
//! let settings = parley_settings::load_settings().unwrap_or_default();
//! println!("webhook receiver on {}", settings.server.bind_addr());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
