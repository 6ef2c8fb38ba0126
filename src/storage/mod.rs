pub mod apps;
pub mod db;
pub mod migrations;
pub mod updates;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::RelayConfig;

pub use db::Database;
pub use migrations::{Migration, MigrationError, MIGRATIONS};
pub use updates::UpdateRecord;

pub const RELAY_DIR: &str = ".dx/relay";

/// Directory holding the store, config and logs for a relay rooted at `path`.
pub fn relay_dir(path: &Path) -> PathBuf {
    path.join(RELAY_DIR)
}

/// Create the relay directory, a migrated store and a default `config.toml`.
/// An existing config is left untouched.
pub async fn init(path: &Path) -> Result<PathBuf> {
    let relay_path = relay_dir(path);

    tokio::fs::create_dir_all(&relay_path).await?;
    tokio::fs::create_dir_all(relay_path.join("logs")).await?;

    let db = Database::new(&relay_path).context("failed to open relay store")?;
    db.initialize().context("failed to migrate relay store")?;

    let config_path = relay_path.join(crate::config::CONFIG_FILE);
    if !tokio::fs::try_exists(&config_path).await? {
        let config = RelayConfig::default();
        tokio::fs::write(&config_path, config.to_toml()?).await?;
    }

    Ok(relay_path)
}
