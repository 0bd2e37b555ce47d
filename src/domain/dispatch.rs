use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of 15-minute slots in one planning horizon.
pub const HORIZON_SLOTS: usize = 96;
pub const SLOT_MINUTES: i64 = 15;

/// One 15-minute decision within a `PlanHorizon`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSlot {
    pub index: usize,
    pub slot_start: DateTime<Utc>,
    pub battery_charge_kw: f64,
    pub battery_discharge_kw: f64,
    pub ev_charge_kw: f64,
    pub ev_name: Option<String>,
    pub slot_price_eur_per_kwh: f64,
    pub expected_pv_kw: f64,
    pub expected_house_load_kw: f64,
    pub battery_soc_end_percent: f64,
    pub ev_soc_end_percent: Option<f64>,
}

impl DispatchSlot {
    pub fn slot_end(&self) -> DateTime<Utc> {
        self.slot_start + Duration::minutes(SLOT_MINUTES)
    }

    /// Mutual exclusion: a slot never both charges and discharges the
    /// battery at once (within solver tolerance).
    pub fn respects_mutual_exclusion(&self) -> bool {
        self.battery_charge_kw * self.battery_discharge_kw < 1e-3
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("plan has {actual} slots, expected {expected}")]
    WrongSlotCount { actual: usize, expected: usize },
    #[error("slot {index} battery SoC {soc}% outside [{min}, {max}]")]
    BatterySocOutOfBounds {
        index: usize,
        soc: f64,
        min: f64,
        max: f64,
    },
    #[error("slot {index} EV SoC {soc}% outside [0, 100]")]
    EvSocOutOfBounds { index: usize, soc: f64 },
    #[error("slot {index} charges and discharges the battery simultaneously")]
    MutualExclusionViolated { index: usize },
    #[error("slot {index} power {power_kw}kW exceeds configured maximum {max_kw}kW")]
    PowerExceedsMaximum {
        index: usize,
        power_kw: f64,
        max_kw: f64,
    },
}

/// The structured output of one LP solve: 96 slots plus metadata. Immutable
/// after extraction; superseded, never reused, on the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHorizon {
    pub slots: Vec<DispatchSlot>,
    pub computed_at: DateTime<Utc>,
    pub solver_status: String,
    pub objective_value: f64,
}

impl PlanHorizon {
    /// Validate against spec invariants: 96 slots, SoC bounds, mutual
    /// exclusion, and power ceilings, given the battery's configured SoC
    /// band and the battery/EV power maxima.
    pub fn validate(
        &self,
        min_soc: f64,
        max_soc: f64,
        battery_max_kw: f64,
        ev_max_kw: f64,
    ) -> Result<(), PlanValidationError> {
        if self.slots.len() != HORIZON_SLOTS {
            return Err(PlanValidationError::WrongSlotCount {
                actual: self.slots.len(),
                expected: HORIZON_SLOTS,
            });
        }
        for slot in &self.slots {
            if slot.battery_soc_end_percent < min_soc - 1e-6
                || slot.battery_soc_end_percent > max_soc + 1e-6
            {
                return Err(PlanValidationError::BatterySocOutOfBounds {
                    index: slot.index,
                    soc: slot.battery_soc_end_percent,
                    min: min_soc,
                    max: max_soc,
                });
            }
            if let Some(ev_soc) = slot.ev_soc_end_percent {
                if !(-1e-6..=100.0 + 1e-6).contains(&ev_soc) {
                    return Err(PlanValidationError::EvSocOutOfBounds {
                        index: slot.index,
                        soc: ev_soc,
                    });
                }
            }
            if !slot.respects_mutual_exclusion() {
                return Err(PlanValidationError::MutualExclusionViolated { index: slot.index });
            }
            let bat_power = slot.battery_charge_kw.max(slot.battery_discharge_kw);
            if bat_power > battery_max_kw + 1e-6 {
                return Err(PlanValidationError::PowerExceedsMaximum {
                    index: slot.index,
                    power_kw: bat_power,
                    max_kw: battery_max_kw,
                });
            }
            if slot.ev_charge_kw > ev_max_kw + 1e-6 {
                return Err(PlanValidationError::PowerExceedsMaximum {
                    index: slot.index,
                    power_kw: slot.ev_charge_kw,
                    max_kw: ev_max_kw,
                });
            }
        }
        Ok(())
    }

    /// Slot-0 figures, which together uniquely describe the action derived
    /// from this plan.
    pub fn slot0(&self) -> Option<&DispatchSlot> {
        self.slots.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: usize, charge: f64, discharge: f64, soc: f64) -> DispatchSlot {
        DispatchSlot {
            index,
            slot_start: Utc::now() + Duration::minutes(index as i64 * SLOT_MINUTES),
            battery_charge_kw: charge,
            battery_discharge_kw: discharge,
            ev_charge_kw: 0.0,
            ev_name: None,
            slot_price_eur_per_kwh: 0.20,
            expected_pv_kw: 0.0,
            expected_house_load_kw: 0.5,
            battery_soc_end_percent: soc,
            ev_soc_end_percent: None,
        }
    }

    fn plan_with(slots: Vec<DispatchSlot>) -> PlanHorizon {
        PlanHorizon {
            slots,
            computed_at: Utc::now(),
            solver_status: "optimal".into(),
            objective_value: 0.0,
        }
    }

    #[test]
    fn validate_rejects_wrong_slot_count() {
        let plan = plan_with(vec![slot(0, 1.0, 0.0, 50.0)]);
        assert_eq!(
            plan.validate(10.0, 90.0, 5.0, 11.0),
            Err(PlanValidationError::WrongSlotCount {
                actual: 1,
                expected: HORIZON_SLOTS
            })
        );
    }

    #[test]
    fn validate_rejects_mutual_exclusion_violation() {
        let mut slots: Vec<_> = (0..HORIZON_SLOTS).map(|i| slot(i, 0.0, 0.0, 50.0)).collect();
        slots[3].battery_charge_kw = 2.0;
        slots[3].battery_discharge_kw = 2.0;
        let plan = plan_with(slots);
        assert!(matches!(
            plan.validate(10.0, 90.0, 5.0, 11.0),
            Err(PlanValidationError::MutualExclusionViolated { index: 3 })
        ));
    }

    #[test]
    fn validate_accepts_well_formed_plan() {
        let slots: Vec<_> = (0..HORIZON_SLOTS).map(|i| slot(i, 0.0, 0.0, 50.0)).collect();
        let plan = plan_with(slots);
        assert!(plan.validate(10.0, 90.0, 5.0, 11.0).is_ok());
    }

    #[test]
    fn validate_rejects_soc_out_of_bounds() {
        let mut slots: Vec<_> = (0..HORIZON_SLOTS).map(|i| slot(i, 0.0, 0.0, 50.0)).collect();
        slots[10].battery_soc_end_percent = 5.0;
        let plan = plan_with(slots);
        assert!(matches!(
            plan.validate(10.0, 90.0, 5.0, 11.0),
            Err(PlanValidationError::BatterySocOutOfBounds { index: 10, .. })
        ));
    }
}
