//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.directories.is_empty() {
        anyhow::bail!("at least one target directory is required");
    }

    validate_search(&config.search)?;
    validate_workers(&config.workers)?;
    validate_network(&config.network)?;
    validate_runtime(&config.runtime)?;

    if config.threads() == 0 && !config.network.enabled {
        anyhow::bail!("no local threads and networking disabled: nothing would evaluate");
    }

    Ok(())
}

/// Validate search configuration
pub fn validate_search(search: &SearchConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&search.keep_prob) {
        anyhow::bail!("keep_prob must be between 0 and 1, got {}", search.keep_prob);
    }
    if let Some(mutator) = &search.mutator {
        if mutator.trim().is_empty() {
            anyhow::bail!("mutator command is empty");
        }
    }
    if let Some(seed) = &search.force_seed {
        seed.parse::<Seed>()?;
    }
    Ok(())
}

/// Validate worker configuration
pub fn validate_workers(workers: &WorkerConfig) -> Result<()> {
    if workers.channel_slack == 0 {
        anyhow::bail!("channel_slack must be at least 1");
    }
    Ok(())
}

/// Validate network configuration
pub fn validate_network(network: &NetworkConfig) -> Result<()> {
    if !(0.01..=2.0).contains(&network.priority) {
        anyhow::bail!("priority must be between 0.01 and 2.0, got {}", network.priority);
    }
    if network.enabled && network.servers.is_empty() {
        anyhow::bail!("networking enabled but no servers configured (use --host-list)");
    }
    Ok(())
}

/// Validate runtime configuration
pub fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if !runtime.stuck_grace_secs.is_finite() || runtime.stuck_grace_secs < 0.0 {
        anyhow::bail!("stuck_grace_secs must be a non-negative number, got {}", runtime.stuck_grace_secs);
    }
    Ok(())
}
