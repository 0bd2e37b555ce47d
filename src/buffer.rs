//! Dynamic buffer calculator (C6): computes the per-cycle
//! minimum battery SoC floor from PV confidence, price spread and time of
//! day. Runs in `observation` mode for the first 14 days after deployment
//! (logs what it *would* set without applying it) before switching to
//! `live`, unless the dashboard keeps it pinned to observation.
use serde::{Deserialize, Serialize};

use crate::config::BufferConfig;
use crate::domain::SystemState;
use crate::error::CoreResult;
use crate::persistence;

const OBSERVATION_PERIOD_DAYS: i64 = 14;
const HYSTERESIS_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferMode {
    Observation,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferHistoryEntry {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub would_set_percent: f64,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    mode: BufferMode,
    history_log: Vec<BufferHistoryEntry>,
    deployed_at: chrono::DateTime<chrono::Utc>,
    pinned_observation: bool,
}

const HISTORY_CAPACITY: usize = 200;

pub struct DynamicBufferCalculator {
    cfg: BufferConfig,
    mode: BufferMode,
    deployed_at: chrono::DateTime<chrono::Utc>,
    pinned_observation: bool,
    history: Vec<BufferHistoryEntry>,
    last_floor_percent: Option<f64>,
    path: std::path::PathBuf,
}

impl DynamicBufferCalculator {
    pub fn new(data_dir: &std::path::Path, cfg: BufferConfig, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            cfg,
            mode: BufferMode::Observation,
            deployed_at: now,
            pinned_observation: false,
            history: Vec::new(),
            last_floor_percent: None,
            path: data_dir.join("buffer_calc.json"),
        }
    }

    pub async fn load(
        data_dir: &std::path::Path,
        cfg: BufferConfig,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CoreResult<Self> {
        let mut calc = Self::new(data_dir, cfg, now);
        if let Some(file) = persistence::load_if_present::<PersistedFile>(&calc.path).await? {
            if file.version == 1 {
                calc.mode = file.mode;
                calc.history = file.history_log;
                calc.deployed_at = file.deployed_at;
                calc.pinned_observation = file.pinned_observation;
            }
        }
        Ok(calc)
    }

    pub async fn save(&self) -> CoreResult<()> {
        persistence::save_atomic(
            &self.path,
            &PersistedFile {
                version: 1,
                mode: self.mode,
                history_log: self.history.clone(),
                deployed_at: self.deployed_at,
                pinned_observation: self.pinned_observation,
            },
        )
        .await
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Dashboard control: pin the calculator to observation mode even past
    /// the 14-day window, or release the pin.
    pub fn set_pinned_observation(&mut self, pinned: bool) {
        self.pinned_observation = pinned;
    }

    /// One per-cycle call. Returns the floor SoC percent to apply this
    /// cycle: in `observation` mode this is always the *previous* applied
    /// floor (the computed value is logged but not applied); in `live`
    /// mode it is the freshly computed, hysteresis-smoothed value.
    ///
    /// `target = base_soc + spread_bonus * price_spread - pv_reduction *
    /// expected_pv_kwh_next_4h * pv_confidence`, clamped to `[10,
    /// configured_max_floor]`, then rounded with 5% hysteresis.
    pub async fn step(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
        _state: &SystemState,
        pv_confidence: f64,
        price_spread_pct: f64,
        forecast_pv_next_4h_kwh: f64,
    ) -> CoreResult<f64> {
        if !self.pinned_observation && self.mode == BufferMode::Observation {
            let days_since_deploy = (now - self.deployed_at).num_days();
            if days_since_deploy >= OBSERVATION_PERIOD_DAYS {
                self.mode = BufferMode::Live;
            }
        }

        let raw_target = self.cfg.base_soc_percent + self.cfg.spread_bonus * price_spread_pct
            - self.cfg.pv_reduction * forecast_pv_next_4h_kwh * pv_confidence;
        let clamped = raw_target.clamp(10.0, self.cfg.max_floor_percent);

        let smoothed = match self.last_floor_percent {
            Some(prev) if (clamped - prev).abs() < HYSTERESIS_PERCENT => prev,
            _ => clamped,
        };

        let applied = self.mode == BufferMode::Live;
        let returned = if applied {
            self.last_floor_percent = Some(smoothed);
            smoothed
        } else {
            self.last_floor_percent.unwrap_or(self.cfg.base_soc_percent)
        };

        if self.history.len() >= HISTORY_CAPACITY {
            self.history.remove(0);
        }
        self.history.push(BufferHistoryEntry {
            ts: now,
            would_set_percent: smoothed,
            applied,
        });

        Ok(returned.max(10.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PricePercentiles;
    use chrono::Utc;

    fn cfg() -> BufferConfig {
        BufferConfig {
            base_soc_percent: 30.0,
            spread_bonus: 0.15,
            pv_reduction: 0.1,
            max_floor_percent: 60.0,
        }
    }

    fn state() -> SystemState {
        SystemState {
            grid_price_eur_per_kwh: 0.2,
            battery_soc_percent: 40.0,
            battery_power_w: 0.0,
            pv_power_w: 0.0,
            house_load_w: 500.0,
            ev_connected: false,
            ev_name: String::new(),
            ev_soc_source: None,
            ev_target_soc_percent: 0.0,
            ev_charge_power_w: 0.0,
            price_percentiles: PricePercentiles {
                p20: 0.1,
                p30: 0.15,
                p40: 0.18,
                p60: 0.25,
                p80: 0.3,
            },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn observation_mode_logs_but_does_not_apply_change() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-buf-{}", std::process::id()));
        let mut calc = DynamicBufferCalculator::new(&dir, cfg(), Utc::now());
        let floor = calc.step(Utc::now(), &state(), 0.9, 50.0, 2.0).await.unwrap();
        assert_eq!(calc.mode(), BufferMode::Observation);
        assert_eq!(floor, 30.0); // last_floor_percent unset -> base_soc fallback
    }

    #[tokio::test]
    async fn switches_to_live_after_fourteen_days() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-buf2-{}", std::process::id()));
        let deployed = Utc::now() - chrono::Duration::days(15);
        let mut calc = DynamicBufferCalculator::new(&dir, cfg(), deployed);
        let floor = calc.step(Utc::now(), &state(), 0.9, 50.0, 2.0).await.unwrap();
        assert_eq!(calc.mode(), BufferMode::Live);
        assert!(floor >= 10.0 && floor <= cfg().max_floor_percent);
    }

    #[tokio::test]
    async fn result_is_never_below_ten_percent() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-buf3-{}", std::process::id()));
        let deployed = Utc::now() - chrono::Duration::days(20);
        let mut calc = DynamicBufferCalculator::new(&dir, cfg(), deployed);
        let floor = calc
            .step(Utc::now(), &state(), 1.0, 0.0, 100.0)
            .await
            .unwrap();
        assert!(floor >= 10.0);
    }
}
