use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "spotgrid")]
#[command(about = "Spot signal and grid trading engine for Binance", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "config/Config.toml", env = "SPOTGRID_CONFIG")]
    config: PathBuf,
    /// Profile overlay, loaded from `Config.{profile}.toml` next to the config file
    #[arg(short, long, global = true, env = "SPOTGRID_PROFILE")]
    profile: Option<String>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor with restored and configured workers
    Run,
    /// Suggest grid bounds and levels from recent hourly volatility
    AutoRange {
        #[arg(long)]
        symbol: String,
        /// Capital the grid will trade with
        #[arg(long, default_value = "100")]
        capital: Decimal,
    },
    /// Print a trade summary from the journal
    Summary {
        /// day, week, month or year
        #[arg(long, default_value = "day")]
        period: String,
        /// Summarize the last completed period instead of the current one
        #[arg(long)]
        previous: bool,
    },
    /// Print the capital ledger
    Capital,
    /// Check the config file and exit
    ValidateConfig,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Run => commands::run::run(&cli.config, profile).await?,
        Commands::AutoRange { symbol, capital } => {
            commands::auto_range::run(&cli.config, profile, &symbol, capital).await?;
        }
        Commands::Summary { period, previous } => {
            commands::summary::run(&cli.config, profile, &period, previous).await?;
        }
        Commands::Capital => commands::capital::run(&cli.config, profile).await?,
        Commands::ValidateConfig => commands::validate::run(&cli.config, profile)?,
    }

    Ok(())
}
