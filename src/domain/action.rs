use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryCommand {
    Idle,
    Charge,
    Discharge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvCommand {
    Idle,
    Charge,
}

/// Why the arbitrator chose this action, for logging and driver-facing
/// explanations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    LpPlan,
    LpPlanWithResidualCorrection,
    StaticFallback,
    ManualOverride,
    BatteryToEvArbitrage,
    QuietHoursHold,
}

/// The single command issued per cycle to the external controller. Derived
/// at the end of every cycle, applied once, retained in the store until the
/// next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub battery_command: BatteryCommand,
    pub battery_power_limit_kw: f64,
    pub battery_price_ceiling_eur_per_kwh: f64,
    pub ev_command: EvCommand,
    pub ev_power_limit_kw: f64,
    pub ev_price_ceiling_eur_per_kwh: f64,
    pub ev_target: Option<String>,
    pub reason: ReasonCode,
}

impl Action {
    pub fn idle(battery_price_ceiling: f64, ev_price_ceiling: f64) -> Self {
        Self {
            battery_command: BatteryCommand::Idle,
            battery_power_limit_kw: 0.0,
            battery_price_ceiling_eur_per_kwh: battery_price_ceiling,
            ev_command: EvCommand::Idle,
            ev_power_limit_kw: 0.0,
            ev_price_ceiling_eur_per_kwh: ev_price_ceiling,
            ev_target: None,
            reason: ReasonCode::LpPlan,
        }
    }
}
