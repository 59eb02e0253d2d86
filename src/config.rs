//! Environment configuration for lumenbridge

use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Environment {
    #[serde(default = "default_environment_name")]
    pub name: String,
    pub core: NetworkConfig,
    pub sdk: NetworkConfig,
    pub migration: MigrationConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub node_url: String,
    pub network_passphrase: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Environment {
    /// Hosted beta environment.
    pub fn beta() -> Self {
        Self {
            name: "beta".to_string(),
            core: NetworkConfig {
                node_url: "https://horizon-core.beta.lumenbridge.io".to_string(),
                network_passphrase: "Lumen Core Beta ; Oct 2018".to_string(),
            },
            sdk: NetworkConfig {
                node_url: "https://horizon-sdk.beta.lumenbridge.io".to_string(),
                network_passphrase: "Lumen SDK Beta ; Dec 2018".to_string(),
            },
            migration: MigrationConfig {
                base_url: "https://migration.beta.lumenbridge.io".to_string(),
                timeout_secs: default_timeout(),
            },
            store: StoreConfig::default(),
        }
    }

    /// Hosted production environment.
    pub fn production() -> Self {
        Self {
            name: "production".to_string(),
            core: NetworkConfig {
                node_url: "https://horizon-core.lumenbridge.io".to_string(),
                network_passphrase: "Lumen Core Mainnet ; Oct 2018".to_string(),
            },
            sdk: NetworkConfig {
                node_url: "https://horizon-sdk.lumenbridge.io".to_string(),
                network_passphrase: "Lumen SDK Mainnet ; Dec 2018".to_string(),
            },
            migration: MigrationConfig {
                base_url: "https://migration.lumenbridge.io".to_string(),
                timeout_secs: default_timeout(),
            },
            store: StoreConfig::default(),
        }
    }
}

/// Loads an environment from a TOML file, falling back to the beta preset
/// when the file is absent.
pub fn load_environment(path: &str) -> Result<Environment, Box<dyn std::error::Error>> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    let environment: Environment = if config_str.is_empty() {
        Environment::beta()
    } else {
        toml::from_str(&config_str)?
    };

    // Validate critical values
    if environment.name.is_empty() {
        return Err("environment name must be set".into());
    }
    if environment.migration.base_url.is_empty() {
        return Err("migration.base_url must be set".into());
    }
    if environment.core.node_url.is_empty() || environment.sdk.node_url.is_empty() {
        return Err("core.node_url and sdk.node_url must be set".into());
    }

    Ok(environment)
}

fn default_environment_name() -> String {
    "custom".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_store_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("lumenbridge").join("preferences.db"))
        .and_then(|path| path.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "./lumenbridge-preferences.db".to_string())
}
