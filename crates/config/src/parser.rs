use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<MasterConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());
    let config = parse_config(&content)?;

    info!("Configuration loaded successfully");
    Ok(config)
}

/// Parse YAML text after environment variable substitution
pub fn parse_config(content: &str) -> Result<MasterConfig> {
    let substituted = substitution::substitute_env_vars(content)?;

    serde_yaml::from_str(&substituted).with_context(|| "Failed to parse YAML configuration")
}

#[instrument]
pub fn generate_default_config() -> MasterConfig {
    MasterConfig {
        service: ServiceConfig {
            name: "OTC Settlement Desk".to_string(),
            environment: Environment::Sandbox,
        },
        settlement: SettlementEngineConfig::default(),
        gateways: GatewaysConfig {
            escrow: EscrowGatewayConfig {
                treasury_account: Some(default_treasury_account()),
                ..EscrowGatewayConfig::default()
            },
            bank: BankGatewayConfig::default(),
        },
        storage: StorageConfig::default(),
        logging: LoggingConfig::default(),
        metrics: MetricsConfig::default(),
        accounts: Vec::new(),
    }
}

#[instrument]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &MasterConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_yaml() {
        let config = generate_default_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = parse_config(&yaml).unwrap();

        assert_eq!(parsed.service.name, config.service.name);
        assert_eq!(
            parsed.gateways.escrow.treasury_account.as_deref(),
            Some("treasury")
        );
        assert!(validate_config(&parsed).is_valid());
    }

    #[test]
    fn test_parse_substitutes_env_vars() {
        std::env::set_var("OTCX_TEST_SERVICE_NAME", "desk-from-env");
        let config = parse_config("service:\n  name: ${OTCX_TEST_SERVICE_NAME}\n").unwrap();
        assert_eq!(config.service.name, "desk-from-env");
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config("/nonexistent/otcx.yaml").is_err());
    }
}
