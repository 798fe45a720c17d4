pub fn default_poll_interval_seconds() -> u64 {
    30
}

pub fn default_max_retries() -> u32 {
    10
}

pub fn default_gateway_timeout_seconds() -> u64 {
    15
}

pub fn default_backoff_initial_delay_ms() -> u64 {
    1000
}

pub fn default_backoff_max_delay_ms() -> u64 {
    60_000
}

pub fn default_backoff_multiplier() -> f64 {
    2.0
}

pub fn default_reconcile_interval_seconds() -> u64 {
    60
}

pub fn default_counter_leg_max_attempts() -> u32 {
    5
}

pub fn default_asset_id() -> String {
    "USDT".to_string()
}

/// Custody account used for releases when none is configured (mock provider only)
pub fn default_treasury_account() -> String {
    "treasury".to_string()
}

pub fn default_max_connections() -> u32 {
    20
}

pub fn default_run_migrations() -> bool {
    true
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn default_metrics_port() -> u16 {
    9090
}
