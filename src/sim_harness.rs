//! Synthetic site harness for the `sim` feature: stands in for the
//! out-of-scope tariff/PV/consumption/vehicle-SoC adapters
//! so the composition root has something to drive the arbitration loop
//! with outside of integration tests. Grounded on `domain::battery`'s and
//! `domain::ev_charger`'s simulated adapters, which this harness owns and
//! steps every cycle.
#![cfg(feature = "sim")]
use chrono::{DateTime, Timelike, Utc};

use crate::arbitration::CycleInputs;
use crate::config::AppConfig;
use crate::domain::{
    Action, BatteryCapabilities, ChargerCapabilities, PricePercentiles, SimulatedBattery,
    SimulatedEvCharger, SocSource, SystemState, TariffPoint, HORIZON_SLOTS,
};
use crate::sequencer::VehicleCandidate;

const VEHICLE_BATTERY_CAPACITY_KWH: f64 = 60.0;

/// A single simulated vehicle permanently connected to the wallbox, so the
/// demo loop exercises EV charging without a real driver app in the loop.
pub struct SimHarness {
    battery: SimulatedBattery,
    charger: SimulatedEvCharger,
    vehicle_name: String,
}

impl SimHarness {
    pub fn new(cfg: &AppConfig) -> Self {
        let battery_caps = BatteryCapabilities {
            capacity_kwh: cfg.battery.capacity_kwh,
            max_charge_kw: cfg.battery.charge_power_kw,
            max_discharge_kw: cfg.battery.discharge_power_kw,
            charge_efficiency: cfg.battery.charge_efficiency,
            discharge_efficiency: cfg.battery.discharge_efficiency,
            min_soc_percent: cfg.battery.min_soc_percent,
            max_soc_percent: cfg.battery.max_soc_percent,
        };
        let charger_caps = ChargerCapabilities {
            max_power_kw: cfg.ev.max_charge_power_kw,
            ..ChargerCapabilities::default()
        };
        let vehicle_name = "Demo EV".to_string();
        let charger = SimulatedEvCharger::new(charger_caps, VEHICLE_BATTERY_CAPACITY_KWH);
        Self {
            battery: SimulatedBattery::new(
                (cfg.battery.min_soc_percent + cfg.battery.max_soc_percent) / 2.0,
                battery_caps,
            ),
            charger,
            vehicle_name,
        }
    }

    /// Connect the demo vehicle if it isn't already, so the very first
    /// cycle already has EV-charging activity to arbitrate over.
    pub async fn ensure_vehicle_connected(&self) {
        if !self.charger.read_state().await.connected {
            self.charger.connect(self.vehicle_name.clone(), 35.0).await;
        }
    }

    /// Step the simulated battery and wallbox by `dt_hours` at the power
    /// levels the previous cycle's `Action` commanded, then build the
    /// `CycleInputs` for the next cycle from the resulting state plus a
    /// synthetic forecast.
    pub async fn observe_and_step(
        &self,
        cfg: &AppConfig,
        previous_action: Option<&Action>,
        dt_hours: f64,
        now: DateTime<Utc>,
    ) -> CycleInputs {
        if let Some(action) = previous_action {
            let battery_power_w = match action.battery_command {
                crate::domain::BatteryCommand::Charge => action.battery_power_limit_kw * 1000.0,
                crate::domain::BatteryCommand::Discharge => {
                    -action.battery_power_limit_kw * 1000.0
                }
                crate::domain::BatteryCommand::Idle => 0.0,
            };
            if self.battery.step(battery_power_w, dt_hours).await.is_err() {
                // Out-of-bounds step: leave the battery at its last valid
                // reading rather than propagating a simulation artifact.
            }

            let ev_power_w = match action.ev_command {
                crate::domain::EvCommand::Charge => action.ev_power_limit_kw * 1000.0,
                crate::domain::EvCommand::Idle => 0.0,
            };
            self.charger
                .step(ev_power_w, dt_hours, cfg.battery.charge_efficiency)
                .await;
        }

        let battery_state = self.battery.read_state().await;
        let charger_state = self.charger.read_state().await;
        let hour = now.hour();

        let state = SystemState {
            grid_price_eur_per_kwh: hourly_price(hour),
            battery_soc_percent: battery_state.soc_percent,
            battery_power_w: battery_state.power_w,
            pv_power_w: pv_output_kw(hour) * 1000.0,
            house_load_w: house_load_kw(hour) * 1000.0,
            ev_connected: charger_state.connected,
            ev_name: charger_state.vehicle_name.clone(),
            ev_soc_source: charger_state
                .connected
                .then_some(SocSource::FromWallbox(charger_state.vehicle_soc_percent)),
            ev_target_soc_percent: 90.0,
            ev_charge_power_w: charger_state.power_w,
            price_percentiles: price_percentiles(),
            timestamp: now,
        };

        let vehicle_candidates = if charger_state.connected {
            vec![VehicleCandidate {
                name: charger_state.vehicle_name,
                soc_percent: charger_state.vehicle_soc_percent,
                target_soc_percent: 90.0,
                hours_to_departure: hours_to_departure(cfg, now),
                currently_connected: true,
            }]
        } else {
            Vec::new()
        };

        CycleInputs {
            state,
            hourly_tariffs: synthetic_tariffs(now),
            pv_forecast_kw: (0..HORIZON_SLOTS)
                .map(|slot| pv_output_kw((hour + (slot as u32 * 15 / 60)) % 24))
                .collect(),
            consumption_forecast_kw: (0..HORIZON_SLOTS)
                .map(|slot| house_load_kw((hour + (slot as u32 * 15 / 60)) % 24))
                .collect(),
            pv_forecast_prev_kw: None,
            consumption_forecast_prev_kw: None,
            price_forecast_prev_eur: None,
            vehicle_candidates,
            local_hour: hour,
            forecast_pv_next_4h_kwh: (0..4).map(|h| pv_output_kw((hour + h) % 24)).sum(),
            price_spread_pct: 40.0,
            now,
        }
    }
}

fn hourly_price(hour: u32) -> f64 {
    match hour {
        0..=5 => 0.12,
        6..=8 => 0.22,
        9..=15 => 0.16,
        16..=20 => 0.32,
        _ => 0.18,
    }
}

fn pv_output_kw(hour: u32) -> f64 {
    if !(6..=19).contains(&hour) {
        return 0.0;
    }
    let x = (hour as f64 - 12.5) / 7.0;
    (5.0 * (1.0 - x * x).max(0.0)).max(0.0)
}

fn house_load_kw(hour: u32) -> f64 {
    if (17..=21).contains(&hour) {
        1.2
    } else {
        0.4
    }
}

fn hours_to_departure(cfg: &AppConfig, now: DateTime<Utc>) -> f64 {
    let deadline = cfg.ev.charge_deadline_hour as i64;
    let current_hour = now.hour() as i64;
    let delta_hours = if deadline > current_hour {
        deadline - current_hour
    } else {
        24 - current_hour + deadline
    };
    delta_hours.max(1) as f64
}

fn price_percentiles() -> PricePercentiles {
    PricePercentiles {
        p20: 0.13,
        p30: 0.15,
        p40: 0.17,
        p60: 0.22,
        p80: 0.30,
    }
}

fn synthetic_tariffs(now: DateTime<Utc>) -> Vec<TariffPoint> {
    (0..48)
        .map(|h| TariffPoint {
            start: now + chrono::Duration::hours(h),
            price_eur_per_kwh: hourly_price(((now.hour() as i64 + h) % 24) as u32),
        })
        .collect()
}
