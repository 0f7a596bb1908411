use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walcast_config::WalcastConfig;

/// Read walcast.toml and substitute `${VAR}` references from the environment.
pub fn load_config(path: &Path) -> Result<WalcastConfig> {
    let content = fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\nRun 'walcast init' to create one.",
            path.display()
        )
    })?;

    let mut config = WalcastConfig::parse(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    config.postgres.connection_string = resolve_env(&config.postgres.connection_string)
        .context("Failed to resolve [postgres].connection_string")?;

    if let Some(checkpoint) = config.checkpoint.path.take() {
        config.checkpoint.path =
            Some(resolve_env(&checkpoint).context("Failed to resolve [checkpoint].path")?);
    }

    Ok(config)
}

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; an unset variable is an error.
pub fn resolve_env(s: &str) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };

        let var_name = &rest[start + 2..start + end];
        let value = std::env::var(var_name)
            .with_context(|| format!("Environment variable {} is not set", var_name))?;

        result.push_str(&rest[..start]);
        result.push_str(&value);
        rest = &rest[start + end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}
