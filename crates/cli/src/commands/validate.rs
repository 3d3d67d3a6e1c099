use anyhow::Result;
use spotgrid_core::ConfigLoader;
use std::path::Path;

pub fn run(path: &Path, profile: Option<&str>) -> Result<()> {
    let config = ConfigLoader::load_from(path, profile)?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        anyhow::bail!("{} problem(s) in {}", problems.len(), path.display());
    }

    println!(
        "{} is valid: {} spot worker(s), {} grid worker(s), capital {} {}",
        path.display(),
        config.spot_workers.len(),
        config.grid_workers.len(),
        config.capital.total_capital,
        config.capital.quote_asset
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_grid_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        std::fs::write(
            &path,
            r#"
            [[grid_workers]]
            symbol = "ETHUSDT"
            lower = 3200
            upper = 2800
            "#,
        )
        .unwrap();
        let err = run(&path, None).unwrap_err();
        assert!(err.to_string().contains("1 problem"));
    }

    #[test]
    fn accepts_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        std::fs::write(
            &path,
            r#"
            [capital]
            total_capital = 500

            [[spot_workers]]
            symbol = "ETHUSDT"
            "#,
        )
        .unwrap();
        run(&path, None).unwrap();
    }
}
