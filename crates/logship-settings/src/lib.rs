//! # logship-settings
//!
//! Layered configuration for the logship agent and server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LogshipSettings::default()`]
//! 2. **Settings file**: `<base_dir>/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LOGSHIP_*` overrides (highest priority)
//!
//! The loaded value is passed down explicitly; there is no global instance.
//!
//! ```no_run
//! let settings = logship_settings::load_settings(None, None).unwrap();
//! println!("listening on {}", settings.server.listen);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, resolve_base_dir,
};
pub use types::*;

/// Default TCP port of the server.
pub const DEFAULT_PORT: u16 = 5102;
/// Delay before retrying a statement that hit a busy/locked database.
pub const RETRY_DELAY_MS: u64 = 25;
/// Consecutive submit failures after which the agent stops.
pub const MAX_AGENT_ERRORS: u32 = 5;
pub const DEFAULT_POOL_SIZE: usize = 4;
/// Search results per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;
