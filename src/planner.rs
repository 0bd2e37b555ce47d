//! Horizon planner (C7): builds and solves the joint battery+EV 96-slot LP
//! and extracts a `PlanHorizon`. Grounded on `optimizer/strategies/milp.rs`'s
//! `good_lp` structure, generalized from a single battery-only series to a
//! two-track battery+EV dispatch.
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::domain::{
    BatteryCapabilities, ChargerCapabilities, DispatchSlot, PlanHorizon, HORIZON_SLOTS,
    SLOT_MINUTES,
};
use crate::domain::{SystemState, TariffPoint};

/// Everything the LP needs for one solve, already resolved by the caller
/// (arbitration loop) from the state store, forecasters and learners.
pub struct PlannerInputs<'a> {
    pub state: &'a SystemState,
    pub hourly_tariffs: &'a [TariffPoint],
    /// Expected PV in kW per 15-min slot, aligned to the plan (padded /
    /// truncated to 96 by the caller if the adapter over/under-delivers).
    pub pv_forecast_kw: &'a [f64],
    pub consumption_forecast_kw: &'a [f64],
    pub price_confidence: f64,
    pub battery: &'a BatteryCapabilities,
    pub charger: &'a ChargerCapabilities,
    pub ev_default_energy_kwh: f64,
    /// Minutes from `now` until the connected vehicle's departure, if any
    /// EV is connected. `None` means no EV, or an EV already at target.
    pub ev_minutes_to_departure: Option<f64>,
    pub dyn_floor_percent: f64,
    pub seasonal_correction_eur_per_kwh: Option<f64>,
    pub battery_max_price_ct: f64,
    pub ev_max_price_ct: f64,
    pub feed_in_tariff_ct: f64,
    pub now: DateTime<Utc>,
}

const MIN_HOURLY_TARIFF_POINTS: usize = 8;
const PRICE_CEILING_PENALTY_MULTIPLIER: f64 = 10.0;

/// Expand hourly tariffs to 96 15-min slots, padding with the last known
/// price if the series runs short.
fn expand_tariffs(hourly: &[TariffPoint]) -> Option<Vec<f64>> {
    if hourly.len() < MIN_HOURLY_TARIFF_POINTS {
        return None;
    }
    let mut slots = Vec::with_capacity(HORIZON_SLOTS);
    for point in hourly {
        for _ in 0..4 {
            slots.push(point.price_eur_per_kwh);
            if slots.len() == HORIZON_SLOTS {
                return Some(slots);
            }
        }
    }
    let last = slots.last().copied().unwrap_or(0.0);
    while slots.len() < HORIZON_SLOTS {
        slots.push(last);
    }
    Some(slots)
}

fn clamp_dep_slot(minutes_to_departure: f64) -> usize {
    let raw = (minutes_to_departure / SLOT_MINUTES as f64).round() as i64;
    raw.clamp(1, HORIZON_SLOTS as i64 - 1) as usize
}

/// Whether the departure target is physically achievable at the EV's max
/// charge power, given only the time remaining. Not a hard gate — only
/// logged.
fn departure_physically_achievable(
    current_soc: f64,
    target_soc: f64,
    ev_cap_kwh: f64,
    ev_max_kw: f64,
    minutes_to_departure: f64,
) -> bool {
    if target_soc <= current_soc {
        return true;
    }
    let needed_hours = (target_soc - current_soc) / 100.0 * ev_cap_kwh / ev_max_kw.max(0.01);
    needed_hours * 60.0 <= minutes_to_departure
}

#[cfg(feature = "optimization")]
mod lp {
    use super::*;
    use good_lp::{constraint, variable, Expression, ProblemVariables, Solution, SolverModel};

    pub fn solve(inputs: &PlannerInputs<'_>) -> Option<PlanHorizon> {
        let prices = expand_tariffs(inputs.hourly_tariffs)?;
        let pv: Vec<f64> = (0..HORIZON_SLOTS)
            .map(|i| inputs.pv_forecast_kw.get(i).copied().unwrap_or(0.0))
            .collect();
        let load: Vec<f64> = (0..HORIZON_SLOTS)
            .map(|i| inputs.consumption_forecast_kw.get(i).copied().unwrap_or(0.3))
            .collect();

        let dt_h = SLOT_MINUTES as f64 / 60.0;
        let min_soc = inputs.battery.min_soc_percent.max(inputs.dyn_floor_percent);
        let max_soc = inputs.battery.max_soc_percent;
        let ev_connected = inputs.state.ev_connected;
        let ev_max_kw = inputs.charger.max_power_kw;
        let ev_cap_kwh = inputs.ev_default_energy_kwh.max(0.1);

        if let Some(minutes) = inputs.ev_minutes_to_departure {
            if ev_connected {
                let current = inputs.state.ev_soc_percent().unwrap_or(0.0);
                let target = inputs.state.ev_target_soc_percent;
                if !departure_physically_achievable(current, target, ev_cap_kwh, ev_max_kw, minutes) {
                    warn!(
                        current_soc = current,
                        target_soc = target,
                        minutes_to_departure = minutes,
                        "EV departure target is not physically achievable at max charge power; \
                         proceeding, solver may relax or report infeasible"
                    );
                }
            }
        }

        let mut problem = ProblemVariables::new();
        let charge = problem.add_vector(variable().min(0.0).max(inputs.battery.max_charge_kw), HORIZON_SLOTS);
        let discharge =
            problem.add_vector(variable().min(0.0).max(inputs.battery.max_discharge_kw), HORIZON_SLOTS);
        let ev_power_max = if ev_connected { ev_max_kw } else { 0.0 };
        let ev_charge = problem.add_vector(variable().min(0.0).max(ev_power_max), HORIZON_SLOTS);
        let soc_b = problem.add_vector(variable().min(min_soc).max(max_soc), HORIZON_SLOTS);
        let soc_e = problem.add_vector(variable().min(0.0).max(100.0), HORIZON_SLOTS);

        let mut objective = Expression::from(0.0);
        for t in 0..HORIZON_SLOTS {
            let pv_surplus_kw = (pv[t] - load[t]).max(0.0);
            let surplus_ratio = (pv_surplus_kw / inputs.battery.max_charge_kw.max(0.01)).min(1.0);
            let mut price_eff = prices[t] * (1.0 - surplus_ratio);
            price_eff *= inputs.price_confidence.clamp(0.0, 1.0).max(0.05);
            if let Some(correction) = inputs.seasonal_correction_eur_per_kwh {
                price_eff += correction;
            }
            let feed_in = inputs.feed_in_tariff_ct / 100.0;

            objective = objective
                + price_eff * dt_h * charge[t]
                - feed_in * dt_h * discharge[t]
                - price_eff * dt_h * pv_surplus_kw.min(inputs.battery.max_charge_kw);

            if prices[t] * 100.0 > inputs.battery_max_price_ct {
                objective = objective + PRICE_CEILING_PENALTY_MULTIPLIER * prices[t] * dt_h * charge[t];
            }
            if ev_connected && prices[t] * 100.0 > inputs.ev_max_price_ct {
                objective = objective + PRICE_CEILING_PENALTY_MULTIPLIER * prices[t] * dt_h * ev_charge[t];
            }
        }

        let mut model = problem.minimise(objective).using(good_lp::default_solver);

        for t in 0..HORIZON_SLOTS {
            let prev_soc_b: Expression = if t == 0 {
                Expression::from(inputs.state.battery_soc_percent)
            } else {
                soc_b[t - 1].into()
            };
            let soc_delta = charge[t] * (inputs.battery.charge_efficiency * dt_h / inputs.battery.capacity_kwh * 100.0)
                - discharge[t] * (dt_h / (inputs.battery.discharge_efficiency.max(0.01) * inputs.battery.capacity_kwh) * 100.0);
            model = model.with(constraint!(soc_b[t] == prev_soc_b + soc_delta));

            model = model.with(constraint!(
                charge[t] + discharge[t] <= inputs.battery.max_charge_kw.max(inputs.battery.max_discharge_kw)
            ));

            let prev_soc_e: Expression = if t == 0 {
                Expression::from(inputs.state.ev_soc_percent().unwrap_or(0.0))
            } else {
                soc_e[t - 1].into()
            };
            if ev_connected {
                let e_delta = ev_charge[t] * (dt_h / ev_cap_kwh * 100.0);
                model = model.with(constraint!(soc_e[t] == prev_soc_e + e_delta));
            } else {
                model = model.with(constraint!(soc_e[t] == 0.0));
                model = model.with(constraint!(ev_charge[t] == 0.0));
            }
        }

        if ev_connected {
            if let Some(minutes) = inputs.ev_minutes_to_departure {
                let dep_slot = clamp_dep_slot(minutes);
                model = model.with(constraint!(soc_e[dep_slot] >= inputs.state.ev_target_soc_percent));
            }
        }

        let solution = match model.solve() {
            Ok(solution) => solution,
            Err(e) => {
                warn!(error = %e, "LP solver failed to find an optimal solution");
                return None;
            }
        };

        let mut slots = Vec::with_capacity(HORIZON_SLOTS);
        for t in 0..HORIZON_SLOTS {
            let battery_charge_kw = solution.value(charge[t]).clamp(0.0, inputs.battery.max_charge_kw);
            let battery_discharge_kw = solution.value(discharge[t]).clamp(0.0, inputs.battery.max_discharge_kw);
            let ev_charge_kw = solution.value(ev_charge[t]).clamp(0.0, ev_power_max.max(0.0));
            let battery_soc_end = solution.value(soc_b[t]).clamp(min_soc, max_soc);
            let ev_soc_end = if ev_connected {
                Some(solution.value(soc_e[t]).clamp(0.0, 100.0))
            } else {
                None
            };

            slots.push(DispatchSlot {
                index: t,
                slot_start: inputs.now + Duration::minutes(t as i64 * SLOT_MINUTES),
                battery_charge_kw,
                battery_discharge_kw,
                ev_charge_kw,
                ev_name: ev_connected.then(|| inputs.state.ev_name.clone()),
                slot_price_eur_per_kwh: prices[t],
                expected_pv_kw: pv[t],
                expected_house_load_kw: load[t],
                battery_soc_end_percent: battery_soc_end,
                ev_soc_end_percent: ev_soc_end,
            });
        }

        let objective_value = slots
            .iter()
            .map(|s| {
                s.slot_price_eur_per_kwh * dt_h * s.battery_charge_kw
                    - (inputs.feed_in_tariff_ct / 100.0) * dt_h * s.battery_discharge_kw
            })
            .sum();

        Some(PlanHorizon {
            slots,
            computed_at: inputs.now,
            solver_status: "optimal".to_string(),
            objective_value,
        })
    }
}

/// Solve the 96-slot joint LP, or return `None` on infeasibility, solver
/// failure, or insufficient tariff coverage. Never panics.
pub fn solve_horizon(inputs: &PlannerInputs<'_>) -> Option<PlanHorizon> {
    #[cfg(feature = "optimization")]
    {
        lp::solve(inputs)
    }
    #[cfg(not(feature = "optimization"))]
    {
        let _ = expand_tariffs(inputs.hourly_tariffs);
        warn!("planner built without the `optimization` feature; always reports infeasible");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PricePercentiles, SocSource};

    fn flat_tariffs(hours: usize, price: f64) -> Vec<TariffPoint> {
        let now = Utc::now();
        (0..hours)
            .map(|h| TariffPoint {
                start: now + Duration::hours(h as i64),
                price_eur_per_kwh: price,
            })
            .collect()
    }

    fn base_state(soc: f64, ev_connected: bool) -> SystemState {
        SystemState {
            grid_price_eur_per_kwh: 0.2,
            battery_soc_percent: soc,
            battery_power_w: 0.0,
            pv_power_w: 0.0,
            house_load_w: 500.0,
            ev_connected,
            ev_name: if ev_connected { "Kia".into() } else { String::new() },
            ev_soc_source: ev_connected.then_some(SocSource::FromApi(20.0)),
            ev_target_soc_percent: 80.0,
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

    #[test]
    fn too_few_tariff_points_yields_no_plan() {
        let tariffs = flat_tariffs(4, 0.2);
        let state = base_state(30.0, false);
        let battery = BatteryCapabilities::default();
        let charger = ChargerCapabilities::default();
        let inputs = PlannerInputs {
            state: &state,
            hourly_tariffs: &tariffs,
            pv_forecast_kw: &[],
            consumption_forecast_kw: &[],
            price_confidence: 1.0,
            battery: &battery,
            charger: &charger,
            ev_default_energy_kwh: 60.0,
            ev_minutes_to_departure: None,
            dyn_floor_percent: 10.0,
            seasonal_correction_eur_per_kwh: None,
            battery_max_price_ct: 30.0,
            ev_max_price_ct: 30.0,
            feed_in_tariff_ct: 5.0,
            now: Utc::now(),
        };
        assert!(solve_horizon(&inputs).is_none());
    }

    #[cfg(feature = "optimization")]
    #[test]
    fn price_valley_concentrates_battery_charging() {
        let now = Utc::now();
        let mut tariffs: Vec<TariffPoint> = (0..24)
            .map(|h| TariffPoint {
                start: now + Duration::hours(h),
                price_eur_per_kwh: if (20..24).contains(&h) { 0.05 } else { 0.30 },
            })
            .collect();
        tariffs.truncate(24);
        let state = base_state(30.0, false);
        let battery = BatteryCapabilities::default();
        let charger = ChargerCapabilities::default();
        let inputs = PlannerInputs {
            state: &state,
            hourly_tariffs: &tariffs,
            pv_forecast_kw: &[],
            consumption_forecast_kw: &[],
            price_confidence: 1.0,
            battery: &battery,
            charger: &charger,
            ev_default_energy_kwh: 60.0,
            ev_minutes_to_departure: None,
            dyn_floor_percent: 10.0,
            seasonal_correction_eur_per_kwh: None,
            battery_max_price_ct: 30.0,
            ev_max_price_ct: 30.0,
            feed_in_tariff_ct: 5.0,
            now,
        };
        let plan = solve_horizon(&inputs).expect("plan should be feasible");
        assert_eq!(plan.slots.len(), HORIZON_SLOTS);

        let valley_slots = &plan.slots[80..96];
        let charging_in_valley = valley_slots.iter().filter(|s| s.battery_charge_kw > 0.1).count();
        assert!(charging_in_valley >= 3, "expected most valley slots to charge, got {charging_in_valley}");
    }

    #[cfg(feature = "optimization")]
    #[test]
    fn no_ev_connected_means_zero_ev_charge_everywhere() {
        let tariffs = flat_tariffs(24, 0.2);
        let state = base_state(50.0, false);
        let battery = BatteryCapabilities::default();
        let charger = ChargerCapabilities::default();
        let inputs = PlannerInputs {
            state: &state,
            hourly_tariffs: &tariffs,
            pv_forecast_kw: &[],
            consumption_forecast_kw: &[],
            price_confidence: 1.0,
            battery: &battery,
            charger: &charger,
            ev_default_energy_kwh: 60.0,
            ev_minutes_to_departure: None,
            dyn_floor_percent: 10.0,
            seasonal_correction_eur_per_kwh: None,
            battery_max_price_ct: 30.0,
            ev_max_price_ct: 30.0,
            feed_in_tariff_ct: 5.0,
            now: Utc::now(),
        };
        let plan = solve_horizon(&inputs).unwrap();
        assert!(plan.slots.iter().all(|s| s.ev_charge_kw.abs() < 1e-6));
    }

    #[test]
    fn departure_achievability_check() {
        assert!(departure_physically_achievable(20.0, 80.0, 60.0, 11.0, 600.0));
        assert!(!departure_physically_achievable(20.0, 80.0, 60.0, 11.0, 10.0));
    }

    #[test]
    fn clamp_dep_slot_stays_in_bounds() {
        assert_eq!(clamp_dep_slot(0.0), 1);
        assert_eq!(clamp_dep_slot(100_000.0), HORIZON_SLOTS - 1);
    }
}
