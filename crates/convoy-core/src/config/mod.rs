//! Engine configuration (convoy.toml)
//!
//! Selects the Intent and State backends and the local clones worktrees are
//! created from.

pub mod parser;
pub mod schema;

use std::path::PathBuf;

pub use parser::{load_config, parse_convoy_toml, parse_convoy_toml_str, to_toml};
pub use schema::{BackendConfig, ConvoyConfig, WorktreeConfig};

pub const CONFIG_FILE: &str = "convoy.toml";

/// `<config dir>/convoy/convoy.toml`
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("convoy")
        .join(CONFIG_FILE))
}
