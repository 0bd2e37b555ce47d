//! Battery capability/state shapes and a simulated adapter used by the
//! `sim` feature and integration tests in place of the out-of-scope
//! hardware adapter (see SPEC_FULL.md §2).
#![allow(dead_code)]
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum BatteryError {
    #[error("communication error: {0}")]
    Communication(String),
    #[error("state of charge out of bounds: {0}%")]
    SocOutOfBounds(f64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatteryStatus {
    Charging,
    Discharging,
    Idle,
}

/// Static per-site battery parameters the planner's LP coefficients are
/// drawn from (spec.md §6 "Current battery state source").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryCapabilities {
    pub capacity_kwh: f64,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
    pub min_soc_percent: f64,
    pub max_soc_percent: f64,
}

impl Default for BatteryCapabilities {
    fn default() -> Self {
        Self {
            capacity_kwh: 15.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            min_soc_percent: 10.0,
            max_soc_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryState {
    pub soc_percent: f64,
    pub power_w: f64,
    pub status: BatteryStatus,
}

/// A deterministic simulated battery for the `sim` feature and tests: no
/// hardware actuation, just a SoC integrator so demo/integration code can
/// exercise a full cycle without a real adapter.
#[derive(Debug)]
pub struct SimulatedBattery {
    state: Arc<RwLock<BatteryState>>,
    caps: BatteryCapabilities,
}

impl SimulatedBattery {
    pub fn new(initial_soc_percent: f64, caps: BatteryCapabilities) -> Self {
        Self {
            state: Arc::new(RwLock::new(BatteryState {
                soc_percent: initial_soc_percent,
                power_w: 0.0,
                status: BatteryStatus::Idle,
            })),
            caps,
        }
    }

    pub async fn read_state(&self) -> BatteryState {
        self.state.read().await.clone()
    }

    pub fn capabilities(&self) -> &BatteryCapabilities {
        &self.caps
    }

    /// Advance the simulated SoC by `dt_hours` at the given signed AC
    /// power (positive charging, negative discharging), applying the
    /// appropriate efficiency leg just like the planner's LP coefficients
    /// assume.
    pub async fn step(&self, power_w: f64, dt_hours: f64) -> Result<(), BatteryError> {
        let mut st = self.state.write().await;
        let power_kw = power_w / 1000.0;
        let delta_kwh = if power_kw >= 0.0 {
            power_kw * dt_hours * self.caps.charge_efficiency
        } else {
            power_kw * dt_hours / self.caps.discharge_efficiency
        };
        let delta_pct = (delta_kwh / self.caps.capacity_kwh.max(0.1)) * 100.0;
        let new_soc = st.soc_percent + delta_pct;
        if !(0.0..=100.0).contains(&new_soc) {
            return Err(BatteryError::SocOutOfBounds(new_soc));
        }
        st.soc_percent = new_soc;
        st.power_w = power_w;
        st.status = if power_w > 10.0 {
            BatteryStatus::Charging
        } else if power_w < -10.0 {
            BatteryStatus::Discharging
        } else {
            BatteryStatus::Idle
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn step_charges_soc_up() {
        let battery = SimulatedBattery::new(50.0, BatteryCapabilities::default());
        battery.step(2000.0, 1.0).await.unwrap();
        let state = battery.read_state().await;
        assert!(state.soc_percent > 50.0);
        assert_eq!(state.status, BatteryStatus::Charging);
    }

    #[tokio::test]
    async fn step_rejects_out_of_bounds_soc() {
        let battery = SimulatedBattery::new(99.0, BatteryCapabilities::default());
        assert!(battery.step(5000.0, 2.0).await.is_err());
    }
}
