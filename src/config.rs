#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level validated configuration record the core accepts (SPEC_FULL.md
/// §6). Fields split into two validation classes per spec.md §7:
/// - **critical** (`#[validate(...)]`-checked): a failure here blocks
///   startup entirely, see `AppConfig::load`.
/// - **non-critical** (`#[serde(default = ...)]`-backed): a missing or
///   malformed value is silently replaced by the documented default; no
///   validator attribute runs on these, so they can never abort startup.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub auth: AuthConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub cycle: CycleConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub ev: EvConfig,

    #[validate(nested)]
    pub pricing: PricingConfig,

    #[validate(nested)]
    pub quiet_hours: QuietHoursConfig,

    #[validate(nested)]
    pub arbitrage: ArbitrageConfig,

    #[validate(nested)]
    pub buffer: BufferConfig,

    #[validate(nested)]
    pub residual: ResidualConfig,

    /// Directory the JSON-persisted subsystem state files live in
    /// (spec.md §6 "Persisted state layout"). Non-critical: missing
    /// directories are created on first write.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse socket address")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AuthConfig {
    #[validate(length(min = 16))]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

/// Cycle timing (spec.md §6: `decision_interval_minutes`,
/// `vehicle_poll_interval_minutes`).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CycleConfig {
    #[serde(default = "default_decision_interval_minutes")]
    #[validate(range(min = 1, max = 120))]
    pub decision_interval_minutes: u32,

    /// Advisory for adapters; the core does not poll anything itself.
    #[serde(default = "default_vehicle_poll_interval_minutes")]
    pub vehicle_poll_interval_minutes: u32,
}

/// Battery LP coefficients (spec.md §6). `min_soc_percent >= max_soc_percent`,
/// non-finite capacity, and efficiencies outside `(0, 1]` are critical
/// configuration errors per spec.md §7's error taxonomy.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_battery_config"))]
pub struct BatteryConfig {
    #[validate(range(min = 0.1, max = 1000.0))]
    pub capacity_kwh: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub charge_power_kw: f64,

    #[validate(range(min = 0.1, max = 100.0))]
    pub discharge_power_kw: f64,

    #[validate(range(min = 0.01, max = 1.0))]
    pub charge_efficiency: f64,

    #[validate(range(min = 0.01, max = 1.0))]
    pub discharge_efficiency: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub max_soc_percent: f64,
}

fn validate_battery_config(config: &BatteryConfig) -> Result<(), validator::ValidationError> {
    if config.min_soc_percent >= config.max_soc_percent {
        return Err(validator::ValidationError::new(
            "min_soc_percent must be less than max_soc_percent",
        ));
    }
    Ok(())
}

/// EV planner fallback parameters (spec.md §6: `ev_default_energy_kwh`,
/// `ev_charge_deadline_hour`).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EvConfig {
    #[validate(range(min = 1.0, max = 500.0))]
    pub default_energy_kwh: f64,

    /// Local hour (0-23) used as the departure-time fallback when no
    /// driver-confirmed `DepartureRecord` exists.
    #[validate(range(min = 0, max = 23))]
    pub charge_deadline_hour: u32,

    #[validate(range(min = 0.1, max = 100.0))]
    pub max_charge_power_kw: f64,
}

/// LP soft ceilings that double as the static-threshold fallback path
/// (spec.md §9 Open Question 3: one configured value feeds both roles).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PricingConfig {
    /// Both the LP objective's soft price ceiling for the battery and the
    /// static-threshold fallback's battery charge-below-this-price rule.
    #[validate(range(min = 0.0, max = 1000.0))]
    pub battery_max_price_ct: f64,

    /// Same dual role as `battery_max_price_ct`, for the EV leg.
    #[validate(range(min = 0.0, max = 1000.0))]
    pub ev_max_price_ct: f64,

    #[serde(default)]
    pub feed_in_tariff_ct: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct QuietHoursConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Local hour (0-23) quiet hours begin.
    #[validate(range(min = 0, max = 23))]
    pub start_hour: u32,

    /// Local hour (0-23) quiet hours end.
    #[validate(range(min = 0, max = 23))]
    pub end_hour: u32,
}

impl QuietHoursConfig {
    /// Whether `hour` (0-23, local time) falls inside the quiet window,
    /// handling the wrap-around case (e.g. 21..06).
    pub fn contains(&self, hour: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Battery-to-EV arbitrage gates (spec.md §6 / §4.4 step 8).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ArbitrageConfig {
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_profit_ct: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub floor_soc_percent: f64,

    /// Whether gate 6 should use the dynamic buffer floor (C6) in addition
    /// to the static configured floor.
    #[serde(default)]
    pub use_dynamic_limit: bool,
}

/// Dynamic buffer calculator coefficients (spec.md §4.6 / §9 Open Question
/// 2). Plain, externally tunable fields rather than compiled-in constants.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BufferConfig {
    #[validate(range(min = 0.0, max = 100.0))]
    pub base_soc_percent: f64,

    #[serde(default = "default_spread_bonus")]
    pub spread_bonus: f64,

    #[serde(default = "default_pv_reduction")]
    pub pv_reduction: f64,

    #[validate(range(min = 10.0, max = 100.0))]
    pub max_floor_percent: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ResidualConfig {
    #[serde(default = "default_rl_enabled")]
    pub enabled: bool,

    #[serde(default = "default_epsilon_start")]
    pub epsilon_start: f64,

    #[serde(default = "default_epsilon_min")]
    pub epsilon_min: f64,

    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_decision_interval_minutes() -> u32 {
    15
}
fn default_vehicle_poll_interval_minutes() -> u32 {
    5
}
fn default_spread_bonus() -> f64 {
    0.15
}
fn default_pv_reduction() -> f64 {
    0.1
}
fn default_rl_enabled() -> bool {
    true
}
fn default_epsilon_start() -> f64 {
    0.3
}
fn default_epsilon_min() -> f64 {
    0.02
}
fn default_epsilon_decay() -> f64 {
    0.999
}

impl AppConfig {
    /// Load configuration from TOML files and environment variables.
    /// Merge order (later overrides earlier): `config/default.toml`,
    /// an optional `config/<environment>.toml`, then `DISPATCH__`-prefixed
    /// environment variables. Validation runs before any I/O happens
    /// downstream; a critical failure here is the only condition under
    /// which the core exits non-zero before the loop begins (spec.md §6).
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        }

        figment = figment.merge(Env::prefixed("DISPATCH__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;
        config
            .validate()
            .context("configuration validation failed")?;

        Ok(config)
    }
}

pub type Config = AppConfig;

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_battery() -> BatteryConfig {
        BatteryConfig {
            capacity_kwh: 15.0,
            charge_power_kw: 5.0,
            discharge_power_kw: 5.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            min_soc_percent: 10.0,
            max_soc_percent: 95.0,
        }
    }

    #[test]
    fn server_config_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        };
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn battery_config_validates() {
        assert!(valid_battery().validate().is_ok());
    }

    #[test]
    fn battery_config_rejects_inverted_soc_band() {
        let mut config = valid_battery();
        config.min_soc_percent = 95.0;
        config.max_soc_percent = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn quiet_hours_wraps_midnight() {
        let qh = QuietHoursConfig {
            enabled: true,
            start_hour: 21,
            end_hour: 6,
        };
        assert!(qh.contains(22));
        assert!(qh.contains(2));
        assert!(!qh.contains(12));
    }

    #[test]
    fn quiet_hours_disabled_contains_nothing() {
        let qh = QuietHoursConfig {
            enabled: false,
            start_hour: 21,
            end_hour: 6,
        };
        assert!(!qh.contains(23));
    }
}
