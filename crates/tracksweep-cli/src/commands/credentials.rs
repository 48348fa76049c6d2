//! Credential chain inspection.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracksweep_core::StorageLocation;
use tracksweep_gc::wiring;

pub async fn check() -> Result<()> {
    let config = super::load_config()?;
    let chain = Arc::new(wiring::credential_chain(&config.gcp));
    println!("Strategies: {}", chain.strategies().join(" -> "));

    let resolved = chain
        .resolve()
        .await
        .context("No credential strategy applied")?;
    println!("Resolved with: {}", resolved.strategy);

    resolved
        .source
        .access_token()
        .await
        .context("Resolved credentials could not mint an access token")?;
    println!("Access token obtained");

    let root = StorageLocation::parse(&config.artifacts.artifact_root())
        .context("Invalid artifact root")?;
    if !matches!(root, StorageLocation::Gcs { .. }) {
        println!("Bucket check skipped: {} is not in Cloud Storage", root);
        return Ok(());
    }

    wiring::gcs_store(&config, chain)?
        .check_access(&root)
        .await
        .with_context(|| format!("Credentials cannot read {}", root))?;
    println!("Bucket access verified: {}", root);
    Ok(())
}
