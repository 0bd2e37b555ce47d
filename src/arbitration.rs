//! Arbitration loop (C11, spec.md §4.4): drives one decision cycle,
//! fusing the LP plan, residual corrections, the dynamic SoC floor,
//! battery->EV arbitrage gates, manual overrides and quiet-hours policy
//! into the single `Action` handed to the downstream (out-of-scope)
//! charge controller.
//!
//! Grounded on `controller/mod.rs::BatteryController::run`'s tick-loop
//! structure: every external call is wrapped so a single failure cannot
//! abort the cycle, and the loop itself never panics on a recoverable
//! error (spec.md §4.4 "Failure semantics").
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::buffer::DynamicBufferCalculator;
use crate::config::AppConfig;
use crate::departure::DepartureStore;
use crate::domain::{
    Action, BatteryCapabilities, ChargerCapabilities, DecisionCategory, EvCommand, BatteryCommand,
    PlanHorizon, ReasonCode, ResidualCorrection, ResidualMode, Season, SystemState, TariffPoint,
    TimeBand,
};
use crate::learning::reaction::ReactionTimingTracker;
use crate::learning::reliability::{ForecastSource, ReliabilityTracker};
use crate::learning::residual::ResidualAgent;
use crate::learning::seasonal::SeasonalLearner;
use crate::override_mgr::OverrideManager;
use crate::planner::{self, PlannerInputs};
use crate::sequencer::{self, SequencerSummary, VehicleCandidate};
use crate::state::{BufferStatus, ReliabilityStatus, StateStore};

/// Threshold (kW) below which a planned or actual power is treated as
/// "not charging" when checking gates and deriving slot-0 actions
/// (spec.md §4.1 "derived with a 0.1 kW threshold").
const POWER_EPSILON_KW: f64 = 0.1;
/// Window, in 15-min slots, the arbitrage gate 5 looks ahead for a
/// cheaper import opportunity (spec.md §4.4 step 8: "next 6 h").
const ARBITRAGE_LOOKAHEAD_SLOTS: usize = 24;

/// Everything the arbitration loop needs from the outside world for one
/// cycle. The out-of-scope adapters (tariff/PV/consumption/vehicle
/// sources) are represented purely as data the caller has already
/// collected; this crate never calls out to them directly (spec.md §1).
pub struct CycleInputs {
    pub state: SystemState,
    pub hourly_tariffs: Vec<TariffPoint>,
    pub pv_forecast_kw: Vec<f64>,
    pub consumption_forecast_kw: Vec<f64>,
    /// `(forecast(t-1), actual(t))` for each source, already unit-matched
    /// (spec.md §4.3: PV source converts to kW before this point).
    pub pv_forecast_prev_kw: Option<f64>,
    pub consumption_forecast_prev_kw: Option<f64>,
    pub price_forecast_prev_eur: Option<f64>,
    /// Every vehicle in contention for the shared wallbox this cycle,
    /// including the currently connected one.
    pub vehicle_candidates: Vec<VehicleCandidate>,
    /// Local hour (0-23) used for quiet-hours and override evaluation.
    pub local_hour: u32,
    /// `expected_pv_kwh` over the next 4h, and the price spread (%) over
    /// the planning horizon, both feeding the dynamic buffer calculator
    /// (spec.md §4.6).
    pub forecast_pv_next_4h_kwh: f64,
    pub price_spread_pct: f64,
    pub now: DateTime<Utc>,
}

/// What the loop produced for this cycle, for the caller to apply to the
/// (out-of-scope) downstream controller and act on.
pub struct CycleOutcome {
    pub action: Action,
    pub plan: Option<PlanHorizon>,
    /// Set when the reaction-timing tracker judges deviations are not
    /// self-correcting; the caller should schedule an extra plan on the
    /// *next* tick, not the current one (spec.md §4.4 step 12).
    pub immediate_replan_requested: bool,
}

/// Learning inputs carried from one cycle to the next: slot-0 realised
/// cost can only be known once the slot has elapsed, so learners update
/// one cycle in arrears against the plan (and residual action) that was
/// actually in force during the slot just completed.
struct PendingLearning {
    season: Season,
    band: TimeBand,
    weekend: bool,
    plan_slot0_cost_eur: f64,
    residual_state_key: Option<crate::learning::residual::StateKey>,
    residual_action_index: Option<usize>,
    residual_would_violate_min_soc: bool,
    residual_would_miss_departure: bool,
}

/// Tracks the average grid price paid while charging the battery, used
/// by arbitrage gate 4. A simple EMA rather than a true historical mean:
/// cheap to maintain per cycle and the gate only needs an order-of-
/// magnitude comparison against the current price.
struct BatteryCostTracker {
    ema_ct: f64,
    seeded: bool,
}

impl BatteryCostTracker {
    fn new() -> Self {
        Self {
            ema_ct: 0.0,
            seeded: false,
        }
    }

    fn observe_charge(&mut self, price_ct: f64) {
        if !self.seeded {
            self.ema_ct = price_ct;
            self.seeded = true;
        } else {
            self.ema_ct = 0.9 * self.ema_ct + 0.1 * price_ct;
        }
    }

    fn average_ct(&self) -> f64 {
        self.ema_ct
    }
}

/// The main cycle driver (C11). Owns every learner and tracker the cycle
/// consults, plus the small amount of cross-cycle state (pending learning
/// sample, battery cost EMA) the spec's step sequence requires.
pub struct ArbitrationEngine {
    cfg: AppConfig,
    battery: BatteryCapabilities,
    charger: ChargerCapabilities,
    store: std::sync::Arc<StateStore>,
    reliability: ReliabilityTracker,
    seasonal: SeasonalLearner,
    reaction: ReactionTimingTracker,
    residual: ResidualAgent,
    buffer: DynamicBufferCalculator,
    overrides: OverrideManager,
    departures: DepartureStore,
    battery_cost: BatteryCostTracker,
    rng: StdRng,
    pending_learning: Option<PendingLearning>,
}

impl ArbitrationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        battery: BatteryCapabilities,
        charger: ChargerCapabilities,
        store: std::sync::Arc<StateStore>,
        reliability: ReliabilityTracker,
        seasonal: SeasonalLearner,
        reaction: ReactionTimingTracker,
        residual: ResidualAgent,
        buffer: DynamicBufferCalculator,
        overrides: OverrideManager,
        departures: DepartureStore,
    ) -> Self {
        Self {
            cfg,
            battery,
            charger,
            store,
            reliability,
            seasonal,
            reaction,
            residual,
            buffer,
            overrides,
            departures,
            battery_cost: BatteryCostTracker::new(),
            rng: StdRng::from_entropy(),
            pending_learning: None,
        }
    }

    pub fn overrides_mut(&mut self) -> &mut OverrideManager {
        &mut self.overrides
    }

    pub fn departures_mut(&mut self) -> &mut DepartureStore {
        &mut self.departures
    }

    pub fn departures(&self) -> &DepartureStore {
        &self.departures
    }

    /// Flush the subsystems that don't self-flush on every write (the
    /// buffer calculator's `step` and the departure store's driver-facing
    /// mutations), for the periodic persistence-flush task in `main.rs`.
    pub async fn flush_persistence(&self) {
        if let Err(e) = self.buffer.save().await {
            warn!(error = %e, "failed to persist buffer calculator");
        }
        if let Err(e) = self.departures.save().await {
            warn!(error = %e, "failed to persist departure store");
        }
    }

    /// Re-evaluate override expiry right now and republish the result, so
    /// API/SSE consumers see an expiry promptly instead of waiting for the
    /// next decision cycle (spec.md §9 "scheduled tasks, not timer
    /// threads").
    pub fn refresh_override_status(&mut self, now: DateTime<Utc>) {
        let status = self.overrides.status(now);
        self.store.set_override_status(status);
    }

    /// Run exactly one cycle (spec.md §4.4's 13 steps). Never returns an
    /// `Err` that should abort the caller's loop: every fallible step is
    /// absorbed into a logged warning and a safe fallback, per spec.md §7.
    pub async fn run_cycle(&mut self, inputs: CycleInputs) -> CycleOutcome {
        let CycleInputs {
            state,
            hourly_tariffs,
            pv_forecast_kw,
            consumption_forecast_kw,
            pv_forecast_prev_kw,
            consumption_forecast_prev_kw,
            price_forecast_prev_eur,
            vehicle_candidates,
            local_hour,
            forecast_pv_next_4h_kwh,
            price_spread_pct,
            now,
        } = inputs;

        // Step 2: forecast-reliability updates from the previous cycle's
        // forecast vs this cycle's observed actual.
        if let Some(prev) = pv_forecast_prev_kw {
            self.reliability
                .update(ForecastSource::Pv, prev, state.pv_power_w / 1000.0);
        }
        if let Some(prev) = consumption_forecast_prev_kw {
            self.reliability.update(
                ForecastSource::Consumption,
                prev,
                state.house_load_w / 1000.0,
            );
        }
        if let Some(prev) = price_forecast_prev_eur {
            self.reliability
                .update(ForecastSource::Price, prev, state.grid_price_eur_per_kwh);
        }
        let reliability_status = ReliabilityStatus {
            pv_confidence: self.reliability.confidence(ForecastSource::Pv),
            consumption_confidence: self.reliability.confidence(ForecastSource::Consumption),
            price_confidence: self.reliability.confidence(ForecastSource::Price),
        };
        self.store.set_reliability(reliability_status.clone());
        if let Err(e) = self.reliability.save().await {
            warn!(error = %e, "failed to persist forecast-reliability tracker");
        }

        // Step 11 (for the PREVIOUS cycle, whose slot has now elapsed):
        // compute realised slot-0 cost and feed every learner.
        self.finish_pending_learning(&state, now).await;

        // Step 3: dynamic SoC floor, lower-bounded by 10% (buffer already
        // clamps there; the `max` below documents the spec's own floor).
        let dyn_floor = self
            .buffer
            .step(
                now,
                &state,
                reliability_status.pv_confidence,
                price_spread_pct,
                forecast_pv_next_4h_kwh,
            )
            .await
            .unwrap_or(self.cfg.buffer.base_soc_percent)
            .max(10.0);
        self.store.set_buffer_status(BufferStatus {
            mode: self.buffer.mode(),
            floor_percent: dyn_floor,
        });

        // Step 4: seasonal correction + planner call.
        let season = state.season();
        let band = state.time_band();
        let weekend = state.is_weekend();
        let seasonal_correction = self
            .seasonal
            .get_correction_factor(season, band, weekend, 10);

        let ev_minutes_to_departure = self.minutes_to_departure(&state, now);

        let planner_inputs = PlannerInputs {
            state: &state,
            hourly_tariffs: &hourly_tariffs,
            pv_forecast_kw: &pv_forecast_kw,
            consumption_forecast_kw: &consumption_forecast_kw,
            price_confidence: reliability_status.price_confidence,
            battery: &self.battery,
            charger: &self.charger,
            ev_default_energy_kwh: self.cfg.ev.default_energy_kwh,
            ev_minutes_to_departure,
            dyn_floor_percent: dyn_floor,
            seasonal_correction_eur_per_kwh: seasonal_correction,
            battery_max_price_ct: self.cfg.pricing.battery_max_price_ct,
            ev_max_price_ct: self.cfg.pricing.ev_max_price_ct,
            feed_in_tariff_ct: self.cfg.pricing.feed_in_tariff_ct,
            now,
        };
        let plan = planner::solve_horizon(&planner_inputs);

        // Steps 5/6: derive the LP (or fallback) action, consulting the
        // residual agent only when a plan exists (it perturbs the LP's
        // own thresholds, it never proposes a standalone action).
        let (mut action, residual_correction, pending) = match &plan {
            Some(plan) => {
                self.store.update_plan(plan);
                self.store.push_decision(
                    DecisionCategory::Plan,
                    "\u{1f4c8}",
                    format!(
                        "LP solved: status={} objective={:.4}",
                        plan.solver_status, plan.objective_value
                    ),
                    None,
                );
                self.action_from_plan(plan, &state, season, band, weekend)
            }
            None => {
                self.store.clear_plan();
                self.store.push_decision(
                    DecisionCategory::Warning,
                    "\u{26a0}\u{fe0f}",
                    "planner returned no plan; using static-threshold fallback",
                    None,
                );
                (self.fallback_action(&state), None, None)
            }
        };
        self.store.set_residual_mode(self.residual.mode());

        // Step 7: override arbitration.
        self.apply_override(&mut action, &state, now, local_hour);

        // Step 8: battery -> EV arbitrage.
        self.apply_arbitrage(&mut action, &plan, &state, dyn_floor);

        // Step 9: charge sequencer, when more than one vehicle contends
        // for the wallbox.
        if !vehicle_candidates.is_empty() {
            let quiet_active = self.cfg.quiet_hours.contains(local_hour);
            let summary = sequencer::select_target(&vehicle_candidates, quiet_active);
            if let Some(target) = &summary.target {
                if action.ev_command == EvCommand::Charge {
                    action.ev_target = Some(target.clone());
                }
            }
            self.store.set_sequencer_summary(summary);
        }

        if action.battery_command == BatteryCommand::Charge {
            self.battery_cost.observe_charge(state.grid_price_eur_per_kwh * 100.0);
        }

        // Step 12: reaction-timing update happens against the PREVIOUS
        // cycle's deviation, already folded into `finish_pending_learning`.
        let immediate_replan_requested = self.reaction.should_replan_immediately();
        if let Err(e) = self.reaction.save().await {
            warn!(error = %e, "failed to persist reaction-timing tracker");
        }
        self.store.set_reaction_ema(self.reaction.ema());

        // Stash what's needed to learn from this cycle's realised outcome
        // next time around (step 11 for the *next* cycle).
        self.pending_learning = pending.or_else(|| {
            plan.as_ref().map(|p| PendingLearning {
                season,
                band,
                weekend,
                plan_slot0_cost_eur: p
                    .slot0()
                    .map(|s| s.slot_price_eur_per_kwh * (s.battery_charge_kw + s.ev_charge_kw) * 0.25)
                    .unwrap_or(0.0),
                residual_state_key: None,
                residual_action_index: None,
                residual_would_violate_min_soc: false,
                residual_would_miss_departure: false,
            })
        });

        // Step 13: publish.
        self.store.update(state, action.clone(), residual_correction);

        if immediate_replan_requested {
            info!("reaction-timing tracker requests an immediate replan on the next tick");
        }

        CycleOutcome {
            action,
            plan,
            immediate_replan_requested,
        }
    }

    fn minutes_to_departure(&self, state: &SystemState, now: DateTime<Utc>) -> Option<f64> {
        if !state.ev_connected {
            return None;
        }
        let departure = self
            .departures
            .confirmed_departure(&state.ev_name)
            .unwrap_or_else(|| {
                // No confirmed departure: fall back to the configured
                // daily deadline hour (spec.md §6 `ev_charge_deadline_hour`).
                let mut d = now
                    .date_naive()
                    .and_hms_opt(self.cfg.ev.charge_deadline_hour, 0, 0)
                    .unwrap()
                    .and_utc();
                if d <= now {
                    d += chrono::Duration::days(1);
                }
                d
            });
        let minutes = (departure - now).num_minutes() as f64;
        Some(minutes.max(1.0))
    }

    /// Steps 5: derive the slot-0 action from the plan, asking the
    /// residual agent for a correction and applying it only in advisory
    /// mode. Returns the action, the correction actually considered (for
    /// the store, even in shadow mode), and a `PendingLearning` seed when
    /// the residual agent was consulted.
    fn action_from_plan(
        &mut self,
        plan: &PlanHorizon,
        state: &SystemState,
        season: Season,
        band: TimeBand,
        weekend: bool,
    ) -> (Action, Option<ResidualCorrection>, Option<PendingLearning>) {
        let slot0 = match plan.slot0() {
            Some(s) => s,
            None => return (self.fallback_action(state), None, None),
        };

        let battery_command = if slot0.battery_charge_kw > POWER_EPSILON_KW {
            BatteryCommand::Charge
        } else if slot0.battery_discharge_kw > POWER_EPSILON_KW {
            BatteryCommand::Discharge
        } else {
            BatteryCommand::Idle
        };
        let ev_command = if slot0.ev_charge_kw > POWER_EPSILON_KW {
            EvCommand::Charge
        } else {
            EvCommand::Idle
        };

        let mut action = Action {
            battery_command,
            battery_power_limit_kw: slot0.battery_charge_kw.max(slot0.battery_discharge_kw),
            battery_price_ceiling_eur_per_kwh: self.cfg.pricing.battery_max_price_ct / 100.0,
            ev_command,
            ev_power_limit_kw: slot0.ev_charge_kw,
            ev_price_ceiling_eur_per_kwh: self.cfg.pricing.ev_max_price_ct / 100.0,
            ev_target: slot0.ev_name.clone(),
            reason: ReasonCode::LpPlan,
        };

        if !self.residual.is_enabled() {
            return (action, None, None);
        }

        let (action_idx, state_key) = self.residual.select_action(state, &mut self.rng);
        let correction = self.residual.correction_for_action(action_idx);
        let clipped = ResidualAgent::clip_correction(
            correction,
            self.cfg.pricing.battery_max_price_ct,
            self.cfg.pricing.ev_max_price_ct,
        );

        let corrected_battery_ceiling =
            (self.cfg.pricing.battery_max_price_ct + clipped.battery_delta_ct).max(0.0) / 100.0;
        let corrected_ev_ceiling =
            (self.cfg.pricing.ev_max_price_ct + clipped.ev_delta_ct).max(0.0) / 100.0;

        // The arbitrator re-checks the plan with the corrected thresholds
        // rather than trusting the agent's own bookkeeping (spec.md
        // §4.3): a correction that would drop the battery ceiling below
        // this slot's price, or below the slot's own SoC outcome, is
        // flagged for the audit but its effect is naturally absent since
        // we only ever *tighten or loosen a price ceiling*, never the
        // plan's physical SoC trajectory.
        let would_violate_min_soc = slot0.battery_soc_end_percent
            < self.battery.min_soc_percent - 1e-6;
        let would_miss_departure = state.ev_connected
            && slot0.ev_soc_end_percent.unwrap_or(100.0) < state.ev_target_soc_percent - 1e-6
            && plan.slots.last().map(|s| s.ev_soc_end_percent.unwrap_or(100.0)).unwrap_or(100.0)
                < state.ev_target_soc_percent - 1e-6;

        match self.residual.mode() {
            ResidualMode::Shadow => {
                self.residual.log_shadow_decision(crate::learning::residual::ShadowLogEntry {
                    ts: state.timestamp,
                    correction: clipped,
                    would_violate_min_soc,
                    would_miss_departure,
                    reward: 0.0,
                });
                if let Some(audit) = self.residual.run_constraint_audit(state.timestamp) {
                    self.store.push_decision(
                        DecisionCategory::Rl,
                        "\u{1f9ea}",
                        format!("residual constraint audit: all_passed={}", audit.all_passed),
                        serde_json::to_value(&audit).ok(),
                    );
                }
            }
            ResidualMode::Advisory => {
                action.battery_price_ceiling_eur_per_kwh = corrected_battery_ceiling;
                action.ev_price_ceiling_eur_per_kwh = corrected_ev_ceiling;
                if state.grid_price_eur_per_kwh > corrected_battery_ceiling {
                    action.battery_command = BatteryCommand::Idle;
                }
                if state.grid_price_eur_per_kwh > corrected_ev_ceiling {
                    action.ev_command = EvCommand::Idle;
                }
                action.reason = ReasonCode::LpPlanWithResidualCorrection;
            }
        }

        let pending = PendingLearning {
            season,
            band,
            weekend,
            plan_slot0_cost_eur: slot0.slot_price_eur_per_kwh
                * (slot0.battery_charge_kw + slot0.ev_charge_kw)
                * 0.25,
            residual_state_key: Some(state_key),
            residual_action_index: Some(action_idx),
            residual_would_violate_min_soc: would_violate_min_soc,
            residual_would_miss_departure: would_miss_departure,
        };

        (action, Some(clipped), Some(pending))
    }

    /// Step 6: the legacy static-threshold fallback, used whenever the LP
    /// returns no plan (spec.md §4.4 step 6 / §4.1 "never raise").
    fn fallback_action(&self, state: &SystemState) -> Action {
        let price_ct = state.grid_price_eur_per_kwh * 100.0;

        let battery_command = if price_ct <= self.cfg.pricing.battery_max_price_ct
            && state.battery_soc_percent < self.battery.max_soc_percent - 1e-6
        {
            BatteryCommand::Charge
        } else {
            BatteryCommand::Idle
        };

        let ev_needs_charge = state
            .ev_soc_percent()
            .map(|soc| soc < state.ev_target_soc_percent - 1e-6)
            .unwrap_or(false);
        let ev_command = if state.ev_connected && ev_needs_charge && price_ct <= self.cfg.pricing.ev_max_price_ct
        {
            EvCommand::Charge
        } else {
            EvCommand::Idle
        };

        Action {
            battery_command,
            battery_power_limit_kw: if battery_command == BatteryCommand::Charge {
                self.battery.max_charge_kw
            } else {
                0.0
            },
            battery_price_ceiling_eur_per_kwh: self.cfg.pricing.battery_max_price_ct / 100.0,
            ev_command,
            ev_power_limit_kw: if ev_command == EvCommand::Charge {
                self.charger.max_power_kw
            } else {
                0.0
            },
            ev_price_ceiling_eur_per_kwh: self.cfg.pricing.ev_max_price_ct / 100.0,
            ev_target: state.ev_connected.then(|| state.ev_name.clone()),
            reason: ReasonCode::StaticFallback,
        }
    }

    /// Step 7: override arbitration. Quiet-hours blocking happens at
    /// activation time (`OverrideManager::activate`); here we only apply
    /// an already-active override to the action.
    fn apply_override(
        &mut self,
        action: &mut Action,
        state: &SystemState,
        now: DateTime<Utc>,
        local_hour: u32,
    ) {
        let quiet_active = self.cfg.quiet_hours.contains(local_hour);
        let _ = quiet_active; // activation-time check only; see OverrideManager::activate.
        let status = self.overrides.status(now);
        self.store.set_override_status(status.clone());
        if let Some(ov) = status {
            if state.ev_connected && ov.vehicle_name == state.ev_name {
                action.ev_command = EvCommand::Charge;
                action.ev_power_limit_kw = self.charger.max_power_kw;
                action.ev_price_ceiling_eur_per_kwh = f64::INFINITY;
                action.ev_target = Some(ov.vehicle_name.clone());
                action.reason = ReasonCode::ManualOverride;
            }
        }
    }

    /// Step 8: the 7-gate battery -> EV arbitrage check (spec.md §4.4
    /// step 8). All seven must pass before the arbitrator swaps the EV's
    /// charge source from grid import to battery discharge.
    fn apply_arbitrage(
        &self,
        action: &mut Action,
        plan: &Option<PlanHorizon>,
        state: &SystemState,
        dyn_floor: f64,
    ) {
        let Some(plan) = plan else { return };
        let Some(slot0) = plan.slot0() else { return };

        let ev_needs_charge = state
            .ev_soc_percent()
            .map(|soc| soc < state.ev_target_soc_percent - 1e-6)
            .unwrap_or(false);
        let gate1 = state.ev_connected && ev_needs_charge;
        let gate2 = slot0.battery_charge_kw <= POWER_EPSILON_KW;
        let gate3 = action.ev_command == EvCommand::Charge;

        let eta_round_trip = (self.battery.charge_efficiency * self.battery.discharge_efficiency).max(0.01);
        let bat_cost_ct = self.battery_cost.average_ct() / eta_round_trip;
        let gate4 = self.battery_cost.average_ct() > 0.0
            && bat_cost_ct + self.cfg.arbitrage.min_profit_ct <= state.grid_price_eur_per_kwh * 100.0;

        let lookahead = &plan.slots[..plan.slots.len().min(ARBITRAGE_LOOKAHEAD_SLOTS)];
        let gate5 = !lookahead
            .iter()
            .any(|s| s.slot_price_eur_per_kwh < state.grid_price_eur_per_kwh - 1e-9);

        let floor = if self.cfg.arbitrage.use_dynamic_limit {
            self.cfg.arbitrage.floor_soc_percent.max(dyn_floor)
        } else {
            self.cfg.arbitrage.floor_soc_percent
        };
        let gate6 = state.battery_soc_percent >= floor;

        let gate7 = slot0.battery_charge_kw <= POWER_EPSILON_KW;

        if gate1 && gate2 && gate3 && gate4 && gate5 && gate6 && gate7 {
            action.battery_command = BatteryCommand::Discharge;
            action.battery_power_limit_kw = action.ev_power_limit_kw.min(self.battery.max_discharge_kw);
            action.reason = ReasonCode::BatteryToEvArbitrage;
        }
    }

    /// Step 11 for the cycle whose slot has just elapsed: compute the
    /// realised slot-0 cost from `state` (this cycle's measurements) and
    /// feed it to the seasonal learner and, if a residual action was in
    /// force, the residual agent. Reward is `plan_cost - actual_cost`
    /// (spec.md §4.3: never the LP's total objective).
    async fn finish_pending_learning(&mut self, state: &SystemState, now: DateTime<Utc>) {
        let Some(pending) = self.pending_learning.take() else {
            return;
        };

        let actual_slot0_cost_eur = state.grid_price_eur_per_kwh
            * ((state.battery_power_w.max(0.0) + state.ev_charge_power_w) / 1000.0)
            * 0.25;
        let plan_error = actual_slot0_cost_eur - pending.plan_slot0_cost_eur;

        if let Err(e) = self
            .seasonal
            .record(pending.season, pending.band, pending.weekend, plan_error)
            .await
        {
            warn!(error = %e, "failed to persist seasonal learner");
        }

        let self_corrected = plan_error.abs() < 0.01;
        self.reaction.observe(self_corrected);

        if let (Some(state_key), Some(action_idx)) =
            (pending.residual_state_key, pending.residual_action_index)
        {
            let reward = pending.plan_slot0_cost_eur - actual_slot0_cost_eur;
            self.residual.learn(
                pending.season,
                state_key,
                action_idx,
                reward,
                state,
                0.1,
                0.9,
            );
            if self.residual.mode() == ResidualMode::Shadow {
                self.residual.log_shadow_decision(crate::learning::residual::ShadowLogEntry {
                    ts: now,
                    correction: ResidualCorrection::zero(),
                    would_violate_min_soc: pending.residual_would_violate_min_soc,
                    would_miss_departure: pending.residual_would_miss_departure,
                    reward,
                });
            }
            if let Err(e) = self.residual.save().await {
                warn!(error = %e, "failed to persist residual agent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ArbitrageConfig, AuthConfig, BatteryConfig, BufferConfig, CycleConfig, EvConfig,
        PricingConfig, QuietHoursConfig, ResidualConfig, ServerConfig, TelemetryConfig,
    };
    use crate::domain::{PricePercentiles, SocSource};
    use chrono::Duration;

    fn test_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            auth: AuthConfig {
                token: "0123456789abcdef".into(),
            },
            telemetry: TelemetryConfig {
                log_level: "info".into(),
                log_json: false,
            },
            cycle: CycleConfig {
                decision_interval_minutes: 15,
                vehicle_poll_interval_minutes: 5,
            },
            battery: BatteryConfig {
                capacity_kwh: 15.0,
                charge_power_kw: 5.0,
                discharge_power_kw: 5.0,
                charge_efficiency: 0.95,
                discharge_efficiency: 0.95,
                min_soc_percent: 10.0,
                max_soc_percent: 95.0,
            },
            ev: EvConfig {
                default_energy_kwh: 60.0,
                charge_deadline_hour: 7,
                max_charge_power_kw: 11.0,
            },
            pricing: PricingConfig {
                battery_max_price_ct: 30.0,
                ev_max_price_ct: 30.0,
                feed_in_tariff_ct: 5.0,
            },
            quiet_hours: QuietHoursConfig {
                enabled: true,
                start_hour: 21,
                end_hour: 6,
            },
            arbitrage: ArbitrageConfig {
                min_profit_ct: 5.0,
                floor_soc_percent: 30.0,
                use_dynamic_limit: false,
            },
            buffer: BufferConfig {
                base_soc_percent: 30.0,
                spread_bonus: 0.15,
                pv_reduction: 0.1,
                max_floor_percent: 60.0,
            },
            residual: ResidualConfig {
                enabled: true,
                epsilon_start: 0.1,
                epsilon_min: 0.02,
                epsilon_decay: 0.999,
            },
            data_dir: std::env::temp_dir().join(format!("dispatch-core-arb-{}", std::process::id())),
        }
    }

    fn sample_state(soc: f64, ev_connected: bool) -> SystemState {
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

    async fn build_engine(cfg: AppConfig) -> ArbitrationEngine {
        let now = Utc::now();
        ArbitrationEngine::new(
            cfg.clone(),
            BatteryCapabilities::default(),
            ChargerCapabilities::default(),
            std::sync::Arc::new(StateStore::new()),
            ReliabilityTracker::new(&cfg.data_dir),
            SeasonalLearner::new(&cfg.data_dir),
            ReactionTimingTracker::new(&cfg.data_dir),
            ResidualAgent::new(&cfg.data_dir, &cfg.residual, now),
            DynamicBufferCalculator::new(&cfg.data_dir, cfg.buffer.clone(), now),
            OverrideManager::new(),
            DepartureStore::new(&cfg.data_dir),
        )
    }

    fn flat_tariffs(hours: usize, price: f64, now: DateTime<Utc>) -> Vec<TariffPoint> {
        (0..hours)
            .map(|h| TariffPoint {
                start: now + Duration::hours(h as i64),
                price_eur_per_kwh: price,
            })
            .collect()
    }

    #[tokio::test]
    async fn too_few_tariff_points_falls_back_to_static_threshold() {
        let cfg = test_config();
        let mut engine = build_engine(cfg.clone()).await;
        let now = Utc::now();
        let inputs = CycleInputs {
            state: sample_state(20.0, false),
            hourly_tariffs: flat_tariffs(4, 0.1, now),
            pv_forecast_kw: vec![],
            consumption_forecast_kw: vec![],
            pv_forecast_prev_kw: None,
            consumption_forecast_prev_kw: None,
            price_forecast_prev_eur: None,
            vehicle_candidates: vec![],
            local_hour: 12,
            forecast_pv_next_4h_kwh: 1.0,
            price_spread_pct: 10.0,
            now,
        };
        let outcome = engine.run_cycle(inputs).await;
        assert!(outcome.plan.is_none());
        assert_eq!(outcome.action.reason, ReasonCode::StaticFallback);
        assert_eq!(outcome.action.battery_command, BatteryCommand::Charge);
    }

    #[cfg(feature = "optimization")]
    #[tokio::test]
    async fn solved_plan_drives_lp_action() {
        let cfg = test_config();
        let mut engine = build_engine(cfg.clone()).await;
        let now = Utc::now();
        let inputs = CycleInputs {
            state: sample_state(30.0, false),
            hourly_tariffs: flat_tariffs(24, 0.2, now),
            pv_forecast_kw: vec![],
            consumption_forecast_kw: vec![],
            pv_forecast_prev_kw: None,
            consumption_forecast_prev_kw: None,
            price_forecast_prev_eur: None,
            vehicle_candidates: vec![],
            local_hour: 12,
            forecast_pv_next_4h_kwh: 1.0,
            price_spread_pct: 10.0,
            now,
        };
        let outcome = engine.run_cycle(inputs).await;
        assert!(outcome.plan.is_some());
        assert_ne!(outcome.action.reason, ReasonCode::StaticFallback);
    }

    #[tokio::test]
    async fn override_forces_ev_charge_for_matching_vehicle() {
        let cfg = test_config();
        let mut engine = build_engine(cfg.clone()).await;
        let now = Utc::now();
        engine.overrides_mut().activate(
            "Kia".into(),
            crate::domain::OverrideSource::Dashboard,
            now,
            12,
            &cfg.quiet_hours,
        );
        let inputs = CycleInputs {
            state: sample_state(50.0, true),
            hourly_tariffs: flat_tariffs(4, 0.1, now),
            pv_forecast_kw: vec![],
            consumption_forecast_kw: vec![],
            pv_forecast_prev_kw: None,
            consumption_forecast_prev_kw: None,
            price_forecast_prev_eur: None,
            vehicle_candidates: vec![],
            local_hour: 12,
            forecast_pv_next_4h_kwh: 1.0,
            price_spread_pct: 10.0,
            now,
        };
        let outcome = engine.run_cycle(inputs).await;
        assert_eq!(outcome.action.ev_command, EvCommand::Charge);
        assert_eq!(outcome.action.reason, ReasonCode::ManualOverride);
    }

    #[tokio::test]
    async fn quiet_hours_blocks_override_activation() {
        let cfg = test_config();
        let mut engine = build_engine(cfg.clone()).await;
        let now = Utc::now();
        let result = engine.overrides_mut().activate(
            "Kia".into(),
            crate::domain::OverrideSource::Messaging,
            now,
            22,
            &cfg.quiet_hours,
        );
        assert!(!result.ok);
        assert!(result.blocked_by_quiet_hours);
    }
}
