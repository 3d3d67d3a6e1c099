use anyhow::{Context, Result};
use rust_decimal::Decimal;
use spotgrid_core::traits::ExchangeClient;
use spotgrid_exchange::BinanceClient;
use spotgrid_orchestrator::grid::{auto_range, calculate_grid_levels, AUTO_RANGE_INTERVAL, AUTO_RANGE_KLINES};
use std::path::Path;

/// Prints suggested grid bounds using public market data only.
pub async fn run(config_path: &Path, profile: Option<&str>, symbol: &str, capital: Decimal) -> Result<()> {
    let config = super::load_config(config_path, profile)?;
    let client = BinanceClient::new(&config.exchange, &config.market_data, None)?;

    let price = client
        .get_price(symbol)
        .await
        .with_context(|| format!("Failed to fetch {symbol} price"))?;
    let klines = client
        .get_klines(symbol, AUTO_RANGE_INTERVAL, AUTO_RANGE_KLINES)
        .await
        .with_context(|| format!("Failed to fetch {symbol} klines"))?;
    let filters = client.symbol_filters(symbol).await?;

    let range = auto_range(&klines, price, capital);
    let levels = calculate_grid_levels(range.lower, range.upper, range.levels, filters.tick_size);

    println!("{symbol} @ {price}");
    match range.volatility {
        Some(v) => println!("Volatility: {}%", (v * Decimal::ONE_HUNDRED).round_dp(2)),
        None => println!("Volatility: unknown ({} klines)", klines.len()),
    }
    println!(
        "Range: {} - {} (±{}%)",
        range.lower,
        range.upper,
        range.range_pct * Decimal::ONE_HUNDRED
    );
    println!("Levels: {} (≈{} per level)", range.levels, (capital / Decimal::from(range.levels)).round_dp(2));
    for level in levels {
        println!("  {level}");
    }
    Ok(())
}
