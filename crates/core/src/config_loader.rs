use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `SPOTGRID_CAPITAL__TOTAL_CAPITAL=500`.
pub const ENV_PREFIX: &str = "SPOTGRID_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `config/Config.toml`, environment overrides and `config/Config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(Path::new("config/Config.toml"), None)
    }

    /// Loads application configuration with a specific profile overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::load_from(Path::new("config/Config.toml"), Some(profile))
    }

    /// Loads from an explicit TOML path. A profile overlay `Config.{profile}.toml`
    /// and a `Config.json` are looked up next to it.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_from(path: &Path, profile: Option<&str>) -> Result<AppConfig> {
        Self::figment(path, profile)
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    fn figment(path: &Path, profile: Option<&str>) -> Figment {
        let dir = path.parent().map_or_else(PathBuf::new, Path::to_path_buf);
        let mut figment = Figment::new().merge(Toml::file(path));
        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(dir.join(format!("Config.{profile}.toml"))));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .join(Json::file(dir.join("Config.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn profile_and_env_override_base_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/Config.toml",
                r#"
                [capital]
                total_capital = 500

                [[spot_workers]]
                symbol = "ETHUSDT"
                "#,
            )?;
            jail.create_file(
                "config/Config.prod.toml",
                r#"
                [supervisor]
                health_interval_secs = 30
                "#,
            )?;
            jail.set_env("SPOTGRID_CAPITAL__AUTO_COMPOUND", "true");

            let config = ConfigLoader::load_with_profile("prod").map_err(|e| e.to_string())?;
            assert_eq!(config.capital.total_capital, dec!(500));
            assert!(config.capital.auto_compound);
            assert_eq!(config.supervisor.health_interval_secs, 30);
            assert_eq!(config.spot_workers.len(), 1);
            Ok(())
        });
    }

    #[test]
    fn missing_files_yield_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = ConfigLoader::load().map_err(|e| e.to_string())?;
            assert!(config.spot_workers.is_empty());
            assert_eq!(config.market_data.requests_per_minute, 1200);
            Ok(())
        });
    }
}
