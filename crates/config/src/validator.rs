use crate::*;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Service name is required")]
    MissingServiceName,

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("{field} must be at least 1.0, got {value}")]
    InvalidMultiplier { field: String, value: f64 },

    #[error("Settlement: {message}")]
    InvalidSettlement { message: String },

    #[error("Gateway '{gateway}': {message}")]
    InvalidGateway { gateway: String, message: String },

    #[error("Storage: {message}")]
    InvalidStorage { message: String },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Account '{user_id}': {message}")]
    InvalidAccount { user_id: String, message: String },

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &MasterConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_service(&config.service, &mut report);
    validate_settlement(&config.settlement, &mut report);
    validate_gateways(&config.gateways, config.service.environment, &mut report);
    validate_storage(&config.storage, config.service.environment, &mut report);
    validate_observability(config, &mut report);
    validate_accounts(&config.accounts, &mut report);

    report
}

fn validate_service(service: &ServiceConfig, report: &mut ValidationReport) {
    if service.name.trim().is_empty() {
        report.add_error(ValidationError::MissingServiceName);
    }
    check_env_placeholders("service.name", &service.name, report);
}

fn validate_settlement(settlement: &SettlementEngineConfig, report: &mut ValidationReport) {
    let positive = [
        ("settlement.poll_interval_seconds", settlement.poll_interval_seconds),
        ("settlement.max_retries", u64::from(settlement.max_retries)),
        ("settlement.gateway_timeout_seconds", settlement.gateway_timeout_seconds),
        ("settlement.reconcile_interval_seconds", settlement.reconcile_interval_seconds),
        ("settlement.counter_leg_max_attempts", u64::from(settlement.counter_leg_max_attempts)),
        ("settlement.backoff.initial_delay_ms", settlement.backoff.initial_delay_ms),
        ("settlement.backoff.max_delay_ms", settlement.backoff.max_delay_ms),
    ];
    for (field, value) in positive {
        if value == 0 {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: field.to_string(),
            });
        }
    }

    if settlement.max_polls == Some(0) {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "settlement.max_polls".to_string(),
        });
    }

    if settlement.backoff.multiplier.is_nan() || settlement.backoff.multiplier < 1.0 {
        report.add_error(ValidationError::InvalidMultiplier {
            field: "settlement.backoff.multiplier".to_string(),
            value: settlement.backoff.multiplier,
        });
    }

    if settlement.backoff.initial_delay_ms > settlement.backoff.max_delay_ms {
        report.add_error(ValidationError::InvalidSettlement {
            message: format!(
                "backoff.initial_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                settlement.backoff.initial_delay_ms, settlement.backoff.max_delay_ms
            ),
        });
    }

    if settlement.gateway_timeout_seconds >= settlement.poll_interval_seconds {
        report.add_warning(
            "settlement.gateway_timeout_seconds",
            "Gateway timeout is not shorter than the poll interval; slow probes will delay polling",
        );
    }

    if settlement.max_polls.is_none() {
        report.add_default("settlement.max_polls", "unbounded");
    }

    if settlement.funding_policy == FundingPolicyKind::AnyBalance {
        report.add_warning(
            "settlement.funding_policy",
            "any_balance treats partially funded escrows as funded",
        );
    }
}

fn validate_http_endpoint(
    gateway: &str,
    base_url: Option<&String>,
    api_key: Option<&String>,
    report: &mut ValidationReport,
) {
    match base_url {
        None => report.add_error(ValidationError::InvalidGateway {
            gateway: gateway.to_string(),
            message: "base_url is required for the http provider".to_string(),
        }),
        Some(raw) => {
            check_env_placeholders(&format!("gateways.{}.base_url", gateway), raw, report);
            match url::Url::parse(raw) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                    if parsed.scheme() == "http" {
                        report.add_warning(
                            &format!("gateways.{}.base_url", gateway),
                            "Plain http endpoint; use https outside local testing",
                        );
                    }
                }
                Ok(parsed) => report.add_error(ValidationError::InvalidGateway {
                    gateway: gateway.to_string(),
                    message: format!("unsupported URL scheme '{}'", parsed.scheme()),
                }),
                Err(e) if !has_unresolved_env_vars(raw) => {
                    report.add_error(ValidationError::InvalidGateway {
                        gateway: gateway.to_string(),
                        message: format!("invalid base_url '{}': {}", raw, e),
                    })
                }
                Err(_) => {}
            }
        }
    }

    match api_key {
        None => report.add_error(ValidationError::InvalidGateway {
            gateway: gateway.to_string(),
            message: "api_key is required for the http provider".to_string(),
        }),
        Some(key) => check_env_placeholders(&format!("gateways.{}.api_key", gateway), key, report),
    }
}

fn validate_gateways(
    gateways: &GatewaysConfig,
    environment: Environment,
    report: &mut ValidationReport,
) {
    let escrow = &gateways.escrow;
    if escrow.asset_id.trim().is_empty() {
        report.add_error(ValidationError::InvalidGateway {
            gateway: "escrow".to_string(),
            message: "asset_id must not be empty".to_string(),
        });
    }

    match escrow.provider {
        GatewayProvider::Http => {
            validate_http_endpoint("escrow", escrow.base_url.as_ref(), escrow.api_key.as_ref(), report);
            if escrow.treasury_account.is_none() {
                report.add_error(ValidationError::InvalidGateway {
                    gateway: "escrow".to_string(),
                    message: "treasury_account is required to release crypto on BUY orders"
                        .to_string(),
                });
            }
        }
        GatewayProvider::Mock => {
            if escrow.treasury_account.is_none() {
                report.add_default("gateways.escrow.treasury_account", &default_treasury_account());
            }
        }
    }

    if gateways.bank.provider == GatewayProvider::Http {
        validate_http_endpoint(
            "bank",
            gateways.bank.base_url.as_ref(),
            gateways.bank.api_key.as_ref(),
            report,
        );
    }

    if environment == Environment::Production
        && (escrow.provider == GatewayProvider::Mock || gateways.bank.provider == GatewayProvider::Mock)
    {
        report.add_warning(
            "gateways",
            "Mock gateways configured in a production environment; no funds will move",
        );
    }
}

fn validate_storage(storage: &StorageConfig, environment: Environment, report: &mut ValidationReport) {
    match storage.backend {
        StorageBackend::Postgres => match &storage.postgres {
            None => report.add_error(ValidationError::InvalidStorage {
                message: "backend 'postgres' requires a postgres section".to_string(),
            }),
            Some(pg) => {
                check_env_placeholders("storage.postgres.url", &pg.url, report);
                if !has_unresolved_env_vars(&pg.url)
                    && !(pg.url.starts_with("postgres://") || pg.url.starts_with("postgresql://"))
                {
                    report.add_error(ValidationError::InvalidStorage {
                        message: "postgres.url must start with postgres:// or postgresql://"
                            .to_string(),
                    });
                }
                if pg.max_connections == 0 {
                    report.add_error(ValidationError::InvalidPositiveInteger {
                        field: "storage.postgres.max_connections".to_string(),
                    });
                }
            }
        },
        StorageBackend::Memory => {
            if environment == Environment::Production {
                report.add_warning(
                    "storage.backend",
                    "In-memory storage loses all orders on restart",
                );
            }
        }
    }
}

fn validate_observability(config: &MasterConfig, report: &mut ValidationReport) {
    let format = config.logging.format.to_lowercase();
    if !["pretty", "json", "compact"].contains(&format.as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(config.logging.format.clone()));
    }

    if config.metrics.enabled && config.metrics.port == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "metrics.port".to_string(),
        });
    }
}

fn validate_accounts(accounts: &[AccountConfig], report: &mut ValidationReport) {
    let mut seen = HashSet::new();

    for account in accounts {
        if uuid::Uuid::parse_str(&account.user_id).is_err() {
            report.add_error(ValidationError::InvalidAccount {
                user_id: account.user_id.clone(),
                message: "user_id must be a UUID".to_string(),
            });
        }

        if !seen.insert(account.user_id.to_lowercase()) {
            report.add_error(ValidationError::InvalidAccount {
                user_id: account.user_id.clone(),
                message: "duplicate entry".to_string(),
            });
        }

        if let Some(bank) = &account.bank {
            if bank.account_holder.trim().is_empty() || bank.account_number.trim().is_empty() {
                report.add_error(ValidationError::InvalidAccount {
                    user_id: account.user_id.clone(),
                    message: "bank.account_holder and bank.account_number are required".to_string(),
                });
            }
        }

        if account.bank.is_none() && account.wallet_address.is_none() {
            report.add_warning(
                &format!("accounts.{}", account.user_id),
                "Entry has neither bank details nor a wallet address",
            );
        }
    }
}

fn check_env_placeholders(field: &str, value: &str, report: &mut ValidationReport) {
    for var in unresolved_env_vars(value) {
        report.add_error(ValidationError::InvalidEnvVar {
            var,
            message: format!("referenced by {} but not set", field),
        });
    }
}
