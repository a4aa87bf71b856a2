//! Config command implementation

use anyhow::{Context, Result};
use raibid_common::AgentConfig;

/// Print the effective configuration as YAML, token masked
pub fn show(config: &AgentConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(&config.redacted())
        .context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}
