//! One-shot garbage collection.

use anyhow::{Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracksweep_gc::wiring;

/// Run one pass and print its summary as JSON. Ctrl+C stops after the
/// run in flight.
pub async fn run_once(dry_run: bool) -> Result<()> {
    let config = super::load_config()?;
    let pool = wiring::connect(&config.database, Duration::from_secs(10))?;
    let credentials = Arc::new(wiring::credential_chain(&config.gcp));
    let mut collector = wiring::collector(&config, pool, credentials)?.dry_run(dry_run);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing the current run");
            on_interrupt.cancel();
        }
    });

    match collector.run_pass(&cancel).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(aborted) => {
            println!("{}", serde_json::to_string_pretty(&aborted.partial)?);
            bail!("GC pass aborted: {}", aborted.source)
        }
    }
}
