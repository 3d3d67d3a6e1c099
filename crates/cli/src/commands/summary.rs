use anyhow::{anyhow, Result};
use chrono::Utc;
use spotgrid_core::summary::SummaryPeriod;
use spotgrid_core::MetricsFormatter;
use spotgrid_data::summary::{period_to_date, previous_period};
use std::path::Path;

pub async fn run(config_path: &Path, profile: Option<&str>, period: &str, previous: bool) -> Result<()> {
    let period: SummaryPeriod = period.parse().map_err(|e: String| anyhow!(e))?;
    let config = super::load_config(config_path, profile)?;
    let store = super::open_store(&config.database).await?;

    let now = Utc::now();
    let summary = if previous {
        previous_period(&store, period, now).await?
    } else {
        period_to_date(&store, period, now).await?
    };
    println!("{}", MetricsFormatter::format_summary(&summary));
    Ok(())
}
