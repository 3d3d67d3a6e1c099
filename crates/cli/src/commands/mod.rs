pub mod auto_range;
pub mod capital;
pub mod run;
pub mod summary;
pub mod validate;

use anyhow::{Context, Result};
use spotgrid_core::config::{AppConfig, DatabaseConfig};
use spotgrid_core::ConfigLoader;
use spotgrid_data::SqliteStore;
use std::path::Path;

/// Loads and validates the config, failing on the first invalid file.
pub fn load_config(path: &Path, profile: Option<&str>) -> Result<AppConfig> {
    let config = ConfigLoader::load_from(path, profile)?;
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid config {}:\n  {}", path.display(), problems.join("\n  "));
    }
    Ok(config)
}

/// Opens the SQLite store, creating its parent directory when needed.
pub async fn open_store(config: &DatabaseConfig) -> Result<SqliteStore> {
    if let Some(file) = config.url.strip_prefix("sqlite://") {
        let file = file.split('?').next().unwrap_or(file);
        if let Some(parent) = Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
    }
    tracing::info!(url = %config.url, "Opening store");
    SqliteStore::from_config(config)
        .await
        .with_context(|| format!("Failed to open store at {}", config.url))
}
