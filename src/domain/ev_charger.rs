//! EV charger capability/state shapes and a simulated adapter. V2G/V2H
//! bidirectional flow is dropped entirely: spec.md §1 names it as a
//! non-goal ("does not model bidirectional vehicle-to-home").
#![allow(dead_code)]
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChargerStatus {
    Available,
    Preparing,
    Charging,
    Finishing,
}

/// Static per-site wallbox parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerCapabilities {
    pub max_current_amps: f64,
    pub voltage_v: f64,
    pub phases: u8,
    pub max_power_kw: f64,
}

impl Default for ChargerCapabilities {
    fn default() -> Self {
        Self {
            max_current_amps: 32.0,
            voltage_v: 230.0,
            phases: 3,
            max_power_kw: 11.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerState {
    pub status: ChargerStatus,
    pub connected: bool,
    pub vehicle_name: String,
    pub vehicle_soc_percent: f64,
    pub power_w: f64,
}

/// A deterministic simulated wallbox for the `sim` feature and tests,
/// mirroring `SimulatedBattery`'s role for the vehicle side of the site.
#[derive(Debug)]
pub struct SimulatedEvCharger {
    state: Arc<RwLock<ChargerState>>,
    caps: ChargerCapabilities,
    vehicle_battery_kwh: f64,
}

impl SimulatedEvCharger {
    pub fn new(caps: ChargerCapabilities, vehicle_battery_kwh: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(ChargerState {
                status: ChargerStatus::Available,
                connected: false,
                vehicle_name: String::new(),
                vehicle_soc_percent: 0.0,
                power_w: 0.0,
            })),
            caps,
            vehicle_battery_kwh,
        }
    }

    pub async fn read_state(&self) -> ChargerState {
        self.state.read().await.clone()
    }

    pub fn capabilities(&self) -> &ChargerCapabilities {
        &self.caps
    }

    pub async fn connect(&self, vehicle_name: String, soc_percent: f64) {
        let mut st = self.state.write().await;
        st.connected = true;
        st.vehicle_name = vehicle_name;
        st.vehicle_soc_percent = soc_percent;
        st.status = ChargerStatus::Preparing;
    }

    pub async fn disconnect(&self) {
        let mut st = self.state.write().await;
        st.connected = false;
        st.vehicle_name.clear();
        st.power_w = 0.0;
        st.status = ChargerStatus::Available;
    }

    /// Advance the simulated vehicle SoC by `dt_hours` at `power_w`
    /// (charge only; discharge is out of scope).
    pub async fn step(&self, power_w: f64, dt_hours: f64, efficiency: f64) {
        let mut st = self.state.write().await;
        if !st.connected {
            return;
        }
        st.power_w = power_w;
        st.status = if power_w > 10.0 {
            ChargerStatus::Charging
        } else {
            st.status
        };
        let energy_kwh = (power_w / 1000.0) * dt_hours * efficiency;
        let delta_pct = (energy_kwh / self.vehicle_battery_kwh.max(0.1)) * 100.0;
        st.vehicle_soc_percent = (st.vehicle_soc_percent + delta_pct).min(100.0);
        if st.vehicle_soc_percent >= 99.9 {
            st.status = ChargerStatus::Finishing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_then_charge_raises_soc() {
        let charger = SimulatedEvCharger::new(ChargerCapabilities::default(), 60.0);
        charger.connect("Kia".into(), 20.0).await;
        charger.step(7000.0, 1.0, 0.9).await;
        let state = charger.read_state().await;
        assert!(state.vehicle_soc_percent > 20.0);
        assert_eq!(state.status, ChargerStatus::Charging);
    }

    #[tokio::test]
    async fn disconnect_clears_vehicle() {
        let charger = SimulatedEvCharger::new(ChargerCapabilities::default(), 60.0);
        charger.connect("Kia".into(), 20.0).await;
        charger.disconnect().await;
        let state = charger.read_state().await;
        assert!(!state.connected);
        assert_eq!(state.vehicle_name, "");
    }
}
