//! # liaison-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LiaisonSettings::default()`]
//! 2. **Settings file**: `~/.liaison/settings.json` or an explicit path
//! 3. **Environment variables**: `LIAISON_*` overrides
//!
//! Settings are passed explicitly to whatever needs them; there is no global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
