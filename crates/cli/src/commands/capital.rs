use anyhow::Result;
use spotgrid_core::traits::StateStore;
use spotgrid_orchestrator::CapitalAllocator;
use std::path::Path;
use std::sync::Arc;

/// Prints the persisted ledger with the allocation check.
pub async fn run(config_path: &Path, profile: Option<&str>) -> Result<()> {
    let config = super::load_config(config_path, profile)?;
    let store: Arc<dyn StateStore> = Arc::new(super::open_store(&config.database).await?);
    let allocator = CapitalAllocator::load(store, &config.capital).await;

    let status = allocator.status();
    println!("{}", serde_json::to_string_pretty(&status)?);

    let check = allocator.validate_allocation();
    if check.valid {
        println!("Allocation OK: {}", check.message);
    } else {
        println!("WARNING: {}", check.message);
    }
    Ok(())
}
