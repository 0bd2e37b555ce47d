//! Composition root (C1/C11 wiring): owns the `StateStore`, builds every
//! learner/tracker the arbitration engine consults, and spawns the tasks
//! that drive the decision cycle. Grounded on
//! `controller/mod.rs::AppState::new`'s "construct every subsystem once,
//! then spawn the tasks that use it" shape, adapted from direct hardware
//! actuation to producing and publishing an `Action` via the state store
//! (spec.md §4.4, §9 "composition root").
#![allow(dead_code)]
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::arbitration::{ArbitrationEngine, CycleOutcome};
use crate::buffer::DynamicBufferCalculator;
use crate::config::AppConfig;
use crate::departure::DepartureStore;
use crate::domain::{BatteryCapabilities, ChargerCapabilities};
use crate::learning::reaction::ReactionTimingTracker;
use crate::learning::reliability::ReliabilityTracker;
use crate::learning::residual::ResidualAgent;
use crate::learning::seasonal::SeasonalLearner;
use crate::override_mgr::OverrideManager;
use crate::state::StateStore;

#[cfg(feature = "sim")]
use crate::sim_harness::SimHarness;

/// Shared application state handed to the API router and the background
/// tasks below. The arbitration engine is wrapped in a `tokio::sync::Mutex`
/// rather than the state store's `parking_lot::Mutex`: `run_cycle` holds
/// the lock across several `.await` points (persistence writes for each
/// learner), which a non-async-aware mutex is not meant for (see
/// `state`'s Open Question 4 resolution in DESIGN.md, which is scoped to
/// the store's own short, synchronous critical sections only).
#[derive(Clone)]
pub struct AppState {
    pub cfg: AppConfig,
    pub store: Arc<StateStore>,
    engine: Arc<Mutex<ArbitrationEngine>>,
}

impl AppState {
    pub async fn new(cfg: AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&cfg.data_dir)
            .await
            .with_context(|| format!("failed to create data directory {:?}", cfg.data_dir))?;

        let now = chrono::Utc::now();
        let store = Arc::new(StateStore::new());

        let battery = BatteryCapabilities {
            capacity_kwh: cfg.battery.capacity_kwh,
            max_charge_kw: cfg.battery.charge_power_kw,
            max_discharge_kw: cfg.battery.discharge_power_kw,
            charge_efficiency: cfg.battery.charge_efficiency,
            discharge_efficiency: cfg.battery.discharge_efficiency,
            min_soc_percent: cfg.battery.min_soc_percent,
            max_soc_percent: cfg.battery.max_soc_percent,
        };
        let charger = ChargerCapabilities {
            max_power_kw: cfg.ev.max_charge_power_kw,
            ..ChargerCapabilities::default()
        };

        // Every learner/tracker owns its own JSON file under `data_dir`
        // and falls back to a fresh instance if the file is missing or
        // unreadable, rather than aborting startup (spec.md §7: a
        // persistence failure is non-critical).
        let reliability = ReliabilityTracker::load(&cfg.data_dir)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "starting forecast-reliability tracker fresh");
                ReliabilityTracker::new(&cfg.data_dir)
            });
        let seasonal = SeasonalLearner::load(&cfg.data_dir)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "starting seasonal learner fresh");
                SeasonalLearner::new(&cfg.data_dir)
            });
        let reaction = ReactionTimingTracker::load(&cfg.data_dir)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "starting reaction-timing tracker fresh");
                ReactionTimingTracker::new(&cfg.data_dir)
            });
        let residual = ResidualAgent::load(&cfg.data_dir, &cfg.residual, now)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "starting residual agent fresh");
                ResidualAgent::new(&cfg.data_dir, &cfg.residual, now)
            });
        let buffer = DynamicBufferCalculator::load(&cfg.data_dir, cfg.buffer.clone(), now)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "starting dynamic buffer calculator fresh");
                DynamicBufferCalculator::new(&cfg.data_dir, cfg.buffer.clone(), now)
            });
        let departures = DepartureStore::load(&cfg.data_dir)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "starting departure store fresh");
                DepartureStore::new(&cfg.data_dir)
            });
        let overrides = OverrideManager::new();

        let engine = ArbitrationEngine::new(
            cfg.clone(),
            battery,
            charger,
            Arc::clone(&store),
            reliability,
            seasonal,
            reaction,
            residual,
            buffer,
            overrides,
            departures,
        );

        Ok(Self {
            cfg,
            store,
            engine: Arc::new(Mutex::new(engine)),
        })
    }

    pub async fn activate_override(
        &self,
        vehicle_name: String,
        source: crate::domain::OverrideSource,
        now: chrono::DateTime<chrono::Utc>,
        local_hour: u32,
    ) -> crate::override_mgr::ActivationResult {
        let mut engine = self.engine.lock().await;
        let result =
            engine
                .overrides_mut()
                .activate(vehicle_name, source, now, local_hour, &self.cfg.quiet_hours);
        engine.refresh_override_status(now);
        result
    }

    pub async fn cancel_override(&self) {
        let mut engine = self.engine.lock().await;
        engine.overrides_mut().cancel();
        engine.refresh_override_status(chrono::Utc::now());
    }

    pub async fn confirm_departure(&self, vehicle_name: String, at: chrono::DateTime<chrono::Utc>) {
        let mut engine = self.engine.lock().await;
        engine.departures_mut().confirm(&vehicle_name, at);
        if let Err(e) = engine.departures().save().await {
            warn!(error = %e, "failed to persist confirmed departure");
        }
    }
}

/// Spawn every background task the decision engine needs: the periodic
/// arbitration cycle, a fast override-expiry refresh, and a persistence
/// flush for the subsystems that don't self-flush on every write. Mirrors
/// `controller::spawn_controller_tasks`'s "one `tokio::spawn` per
/// concern" composition, minus the hardware/safety/V2X tasks that concern
/// does not apply to this crate (spec.md §1).
pub fn spawn_controller_tasks(state: AppState, cfg: AppConfig) {
    #[cfg(feature = "sim")]
    {
        let state = state.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            run_sim_loop(state, cfg).await;
        });
    }

    #[cfg(not(feature = "sim"))]
    {
        let _ = (&state, &cfg);
        warn!("the `sim` feature is disabled: no decision cycle will run without an external driver calling into the arbitration engine");
    }

    let override_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let mut engine = override_state.engine.lock().await;
            engine.refresh_override_status(chrono::Utc::now());
        }
    });

    let flush_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
        loop {
            interval.tick().await;
            let engine = flush_state.engine.lock().await;
            engine.flush_persistence().await;
        }
    });
}

/// Drive the arbitration engine once per `decision_interval_minutes` using
/// the `sim` feature's synthetic site (spec.md §1: the real tariff/PV/
/// consumption/vehicle-SoC adapters are out of scope). An
/// `immediate_replan_requested` outcome runs one extra cycle right away
/// instead of waiting for the next tick, per spec.md §4.4 step 12.
#[cfg(feature = "sim")]
async fn run_sim_loop(state: AppState, cfg: AppConfig) {
    let harness = SimHarness::new(&cfg);
    harness.ensure_vehicle_connected().await;

    let dt_hours = cfg.cycle.decision_interval_minutes as f64 / 60.0;
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        cfg.cycle.decision_interval_minutes.max(1) * 60,
    ));
    let mut previous_action: Option<crate::domain::Action> = None;

    loop {
        interval.tick().await;
        let outcome = run_one_cycle(&state, &cfg, &harness, previous_action.as_ref(), dt_hours).await;
        previous_action = Some(outcome.action.clone());

        if outcome.immediate_replan_requested {
            info!("running an extra cycle immediately per reaction-timing tracker request");
            let outcome =
                run_one_cycle(&state, &cfg, &harness, previous_action.as_ref(), 0.0).await;
            previous_action = Some(outcome.action);
        }
    }
}

#[cfg(feature = "sim")]
async fn run_one_cycle(
    state: &AppState,
    cfg: &AppConfig,
    harness: &SimHarness,
    previous_action: Option<&crate::domain::Action>,
    dt_hours: f64,
) -> CycleOutcome {
    let now = chrono::Utc::now();
    let inputs = harness
        .observe_and_step(cfg, previous_action, dt_hours, now)
        .await;
    let mut engine = state.engine.lock().await;
    engine.run_cycle(inputs).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut cfg = test_config_base();
        cfg.data_dir = std::env::temp_dir().join(format!(
            "dispatch-core-controller-test-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        cfg
    }

    fn test_config_base() -> AppConfig {
        use crate::config::{
            ArbitrageConfig, AuthConfig, BatteryConfig, BufferConfig, CycleConfig, EvConfig,
            PricingConfig, QuietHoursConfig, ResidualConfig, ServerConfig, TelemetryConfig,
        };
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
            data_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn new_creates_data_dir_and_fresh_state() {
        let cfg = test_config();
        let state = AppState::new(cfg.clone()).await.expect("state");
        assert!(cfg.data_dir.is_dir());
        let snapshot = state.store.snapshot();
        assert!(snapshot.plan.is_none());
        let _ = std::fs::remove_dir_all(&cfg.data_dir);
    }

    #[tokio::test]
    async fn override_activate_then_cancel_round_trips_through_store() {
        let cfg = test_config();
        let state = AppState::new(cfg.clone()).await.expect("state");
        let now = chrono::Utc::now();
        let result = state
            .activate_override(
                "Kia".into(),
                crate::domain::OverrideSource::Dashboard,
                now,
                12,
            )
            .await;
        assert!(result.ok);
        assert!(state.store.snapshot().override_status.is_some());

        state.cancel_override().await;
        assert!(state.store.snapshot().override_status.is_none());
        let _ = std::fs::remove_dir_all(&cfg.data_dir);
    }
}
