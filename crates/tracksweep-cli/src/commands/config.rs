//! Configuration inspection.

use anyhow::Result;

pub fn check() -> Result<()> {
    let config = super::load_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("Configuration is valid");
    Ok(())
}
