//! Path resolution for capstan
//!
//! # Environment Variables
//!
//! - `CAPSTAN_CONFIG_DIR` - Override config directory
//! - `CAPSTAN_STATE_DIR` - Override state directory (holds `state.db`)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `CAPSTAN_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/capstan` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\capstan`
//!    - macOS/Linux: `~/.config/capstan`
//!
//! For state_dir():
//! 1. `CAPSTAN_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/capstan` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\capstan`
//!    - macOS/Linux: `~/.local/state/capstan`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "CAPSTAN_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "CAPSTAN_STATE_DIR";

/// Config file name inside [`config_dir`]
pub const CONFIG_FILE: &str = "capstan.toml";

/// State database name inside [`state_dir`]
pub const STATE_DB: &str = "state.db";

/// Get the capstan config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!("Using config dir from {ENV_CONFIG_DIR}: {}", path.display());
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("capstan");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("capstan"));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join("capstan");
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the capstan state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {ENV_STATE_DIR}: {}", path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("capstan");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            return Ok(local_app_data.join("capstan"));
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("capstan");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Default location of `capstan.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Default location of the state database
pub fn state_db() -> Result<PathBuf> {
    Ok(state_dir()?.join(STATE_DB))
}

/// Expand `~` and environment variables in a path string.
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
