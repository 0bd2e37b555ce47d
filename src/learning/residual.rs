//! Residual RL agent (C5, spec.md §4.3): a 49-action (7x7) tabular
//! Q-learner that perturbs the LP's battery/EV price thresholds by a
//! bounded ct/kWh delta. Shadow mode only logs the correction; advisory
//! mode actually applies it at the arbitrator. The agent never proposes a
//! "full action" of its own — it only nudges the LP's own thresholds.
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ResidualConfig;
use crate::domain::{NUM_ACTIONS, Season, ResidualCorrection, ResidualMode, SystemState};
use crate::error::CoreResult;
use crate::persistence;

/// Number of discretised features in the state vector (spec.md §4.3: "the
/// existing 31-feature discretisation of SystemState").
pub const FEATURE_COUNT: usize = 31;

/// A state key is the tuple of per-feature bin indices, joined into a
/// stable string so it can be a JSON map key (spec.md §6's
/// `q_table: map<state_key, [49 floats]>`).
pub type StateKey = String;

fn bucket(value: f64, min: f64, max: f64, bins: usize) -> u8 {
    if bins <= 1 {
        return 0;
    }
    let span = (max - min).max(1e-9);
    let ratio = ((value - min) / span).clamp(0.0, 0.999_999);
    (ratio * bins as f64).floor() as u8
}

/// Discretise a `SystemState` into the fixed-width feature vector the
/// Q-table is keyed on.
pub fn discretize(state: &SystemState) -> [u8; FEATURE_COUNT] {
    let mut f = [0u8; FEATURE_COUNT];
    let p = &state.price_percentiles;

    f[0] = bucket(state.battery_soc_percent, 0.0, 100.0, 10);
    f[1] = state
        .ev_soc_percent()
        .map(|soc| bucket(soc, 0.0, 100.0, 10))
        .unwrap_or(10);
    f[2] = bucket(state.ev_target_soc_percent, 0.0, 100.0, 10);
    f[3] = bucket(state.grid_price_eur_per_kwh, 0.0, 1.0, 5);
    f[4] = (state.grid_price_eur_per_kwh < p.p20) as u8;
    f[5] = (state.grid_price_eur_per_kwh < p.p30) as u8;
    f[6] = (state.grid_price_eur_per_kwh < p.p40) as u8;
    f[7] = (state.grid_price_eur_per_kwh < p.p60) as u8;
    f[8] = (state.grid_price_eur_per_kwh < p.p80) as u8;
    let pv_kw = state.pv_power_w / 1000.0;
    let load_kw = (state.house_load_w / 1000.0).max(0.1);
    f[9] = bucket(pv_kw / load_kw, 0.0, 3.0, 5);
    f[10] = bucket(load_kw, 0.0, 5.0, 5);
    f[11] = state.time_band().index() as u8;
    f[12] = state.season().index() as u8;
    f[13] = state.is_weekend() as u8;
    f[14] = state.ev_connected as u8;
    f[15] = if state.battery_power_w > 10.0 {
        1
    } else if state.battery_power_w < -10.0 {
        2
    } else {
        0
    };
    f[16] = bucket(state.timestamp.timestamp() as f64 % 86_400.0, 0.0, 86_400.0, 24);
    f[17] = bucket(p.p20, 0.0, 0.5, 5);
    f[18] = bucket(p.p30, 0.0, 0.5, 5);
    f[19] = bucket(p.p40, 0.0, 0.5, 5);
    f[20] = bucket(p.p60, 0.0, 0.5, 5);
    f[21] = bucket(p.p80, 0.0, 0.5, 5);
    f[22] = bucket(state.grid_price_eur_per_kwh, 0.0, 1.0, 10);
    f[23] = bucket(state.ev_charge_power_w / 1000.0, 0.0, 11.0, 5);
    f[24] = bucket(state.battery_power_w.abs() / 1000.0, 0.0, 5.0, 5);
    f[25] = chrono::Datelike::weekday(&state.timestamp).num_days_from_monday() as u8;
    f[26] = (state.pv_power_w > 50.0) as u8;
    f[27] = (state.house_load_w > 2000.0) as u8;
    f[28] = state
        .ev_soc_percent()
        .map(|soc| bucket((state.ev_target_soc_percent - soc).max(0.0), 0.0, 100.0, 5))
        .unwrap_or(0);
    f[29] = (state.grid_price_eur_per_kwh > p.p40) as u8;
    f[30] = 0;
    f
}

fn key_of(features: &[u8; FEATURE_COUNT]) -> StateKey {
    features
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditCheck {
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintAudit {
    pub no_soc_violation: AuditCheck,
    pub no_missed_departure: AuditCheck,
    pub magnitude_bounded: AuditCheck,
    pub win_rate_above_half: AuditCheck,
    pub all_passed: bool,
}

/// One logged shadow-mode correction, retained long enough to run the
/// constraint audit (spec.md §4.3) after >=30 days of shadow operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowLogEntry {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub correction: ResidualCorrection,
    pub would_violate_min_soc: bool,
    pub would_miss_departure: bool,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    q_table: HashMap<StateKey, [f64; NUM_ACTIONS]>,
    epsilon: f64,
    step_count: u64,
    shadow_start_ts: chrono::DateTime<chrono::Utc>,
    mode: ResidualMode,
    seasonal_replay_buffers: HashMap<String, VecDeque<(StateKey, usize, f64, StateKey)>>,
}

const PERSISTED_VERSION: u32 = 2;
const REPLAY_CAPACITY_PER_SEASON: usize = 500;
const SHADOW_MIN_DAYS: i64 = 30;

pub struct ResidualAgent {
    q_table: HashMap<StateKey, [f64; NUM_ACTIONS]>,
    epsilon: f64,
    epsilon_min: f64,
    epsilon_decay: f64,
    step_count: u64,
    shadow_start_ts: chrono::DateTime<chrono::Utc>,
    mode: ResidualMode,
    replay: HashMap<Season, VecDeque<(StateKey, usize, f64, StateKey)>>,
    shadow_log: VecDeque<ShadowLogEntry>,
    path: PathBuf,
    enabled: bool,
}

impl ResidualAgent {
    pub fn new(data_dir: &std::path::Path, cfg: &ResidualConfig, now: chrono::DateTime<chrono::Utc>) -> Self {
        let mut replay = HashMap::new();
        for s in [Season::Djf, Season::Mam, Season::Jja, Season::Son] {
            replay.insert(s, VecDeque::with_capacity(REPLAY_CAPACITY_PER_SEASON));
        }
        Self {
            q_table: HashMap::new(),
            epsilon: cfg.epsilon_start,
            epsilon_min: cfg.epsilon_min,
            epsilon_decay: cfg.epsilon_decay,
            step_count: 0,
            shadow_start_ts: now,
            mode: ResidualMode::Shadow,
            replay,
            shadow_log: VecDeque::with_capacity(4096),
            path: data_dir.join("rl_model.json"),
            enabled: cfg.enabled,
        }
    }

    pub async fn load(
        data_dir: &std::path::Path,
        cfg: &ResidualConfig,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CoreResult<Self> {
        let mut agent = Self::new(data_dir, cfg, now);
        if let Some(file) = persistence::load_if_present::<PersistedFile>(&agent.path).await? {
            // Version mismatch (e.g. a prior full-action agent) resets the
            // Q-table but preserves counters (spec.md §6).
            if file.version == PERSISTED_VERSION {
                agent.q_table = file.q_table;
                for (key, buf) in file.seasonal_replay_buffers {
                    if let Some(season) = season_from_key(&key) {
                        agent.replay.insert(season, buf);
                    }
                }
            }
            agent.epsilon = file.epsilon;
            agent.step_count = file.step_count;
            agent.shadow_start_ts = file.shadow_start_ts;
            agent.mode = file.mode;
        }
        Ok(agent)
    }

    pub async fn save(&self) -> CoreResult<()> {
        let mut seasonal_replay_buffers = HashMap::new();
        for (season, buf) in &self.replay {
            seasonal_replay_buffers.insert(season_key(*season), buf.clone());
        }
        let file = PersistedFile {
            version: PERSISTED_VERSION,
            q_table: self.q_table.clone(),
            epsilon: self.epsilon,
            step_count: self.step_count,
            shadow_start_ts: self.shadow_start_ts,
            mode: self.mode,
            seasonal_replay_buffers,
        };
        persistence::save_atomic(&self.path, &file).await
    }

    pub fn mode(&self) -> ResidualMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// epsilon-greedy action selection. Exploration decays as
    /// `epsilon = max(epsilon_min, epsilon_0 * decay^steps)` (spec.md
    /// §4.3); the caller is expected to call `record_step` once per cycle
    /// so the decay actually advances.
    pub fn select_action(&self, state: &SystemState, rng: &mut impl Rng) -> (usize, StateKey) {
        let key = key_of(&discretize(state));
        if rng.gen::<f64>() < self.epsilon {
            (rng.gen_range(0..NUM_ACTIONS), key)
        } else {
            let q = self.q_table.get(&key);
            let best = q
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                        .map(|(i, _)| i)
                        .unwrap_or(NUM_ACTIONS / 2)
                })
                .unwrap_or(NUM_ACTIONS / 2); // centre action (0,0 delta) when unseen
            (best, key)
        }
    }

    pub fn correction_for_action(&self, action: usize) -> ResidualCorrection {
        ResidualCorrection::from_action_index(action)
    }

    /// Safety clipping: the corrected threshold can never go negative
    /// (spec.md §4.3). SoC/departure safety is enforced by the arbitrator
    /// re-checking the plan, not here.
    pub fn clip_correction(
        correction: ResidualCorrection,
        battery_threshold_ct: f64,
        ev_threshold_ct: f64,
    ) -> ResidualCorrection {
        let mut c = correction;
        if battery_threshold_ct + c.battery_delta_ct < 0.0 {
            c.battery_delta_ct = -battery_threshold_ct;
        }
        if ev_threshold_ct + c.ev_delta_ct < 0.0 {
            c.ev_delta_ct = -ev_threshold_ct;
        }
        c
    }

    fn decay_epsilon(&mut self) {
        self.step_count += 1;
        self.epsilon = (self.epsilon * self.epsilon_decay).max(self.epsilon_min);
    }

    /// Q-learning update plus stratified replay. `reward` is
    /// `plan_slot0_cost - actual_slot0_cost` in EUR (spec.md §4.3: never
    /// the LP's total objective).
    pub fn learn(
        &mut self,
        season: Season,
        state_key: StateKey,
        action: usize,
        reward: f64,
        next_state: &SystemState,
        learning_rate: f64,
        discount: f64,
    ) {
        let next_key = key_of(&discretize(next_state));
        self.apply_update(&state_key, action, reward, &next_key, learning_rate, discount);

        let buf = self.replay.entry(season).or_insert_with(|| {
            VecDeque::with_capacity(REPLAY_CAPACITY_PER_SEASON)
        });
        if buf.len() >= REPLAY_CAPACITY_PER_SEASON {
            buf.pop_front();
        }
        buf.push_back((state_key, action, reward, next_key));
        self.decay_epsilon();
    }

    fn apply_update(
        &mut self,
        state_key: &str,
        action: usize,
        reward: f64,
        next_key: &str,
        learning_rate: f64,
        discount: f64,
    ) {
        let next_max = self
            .q_table
            .get(next_key)
            .map(|row| row.iter().cloned().fold(f64::MIN, f64::max))
            .unwrap_or(0.0);
        let row = self.q_table.entry(state_key.to_string()).or_insert([0.0; NUM_ACTIONS]);
        let td_target = reward + discount * next_max;
        row[action] += learning_rate * (td_target - row[action]);
    }

    /// Replay a stratified batch: equal counts drawn from every non-empty
    /// per-season sub-buffer, preventing seasonal forgetting (spec.md
    /// §4.3).
    pub fn replay_batch(&mut self, per_season: usize, learning_rate: f64, discount: f64, rng: &mut impl Rng) {
        let seasons: Vec<Season> = self
            .replay
            .iter()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(s, _)| *s)
            .collect();
        let mut updates = Vec::new();
        for season in seasons {
            let buf = &self.replay[&season];
            for _ in 0..per_season.min(buf.len()) {
                let idx = rng.gen_range(0..buf.len());
                updates.push(buf[idx].clone());
            }
        }
        for (state_key, action, reward, next_key) in updates {
            self.apply_update(&state_key, action, reward, &next_key, learning_rate, discount);
        }
    }

    /// Append a shadow-mode decision for later audit. Only meaningful in
    /// `Shadow` mode; advisory mode corrections are already live and
    /// audited by the arbitrator's own invariant checks instead.
    pub fn log_shadow_decision(&mut self, entry: ShadowLogEntry) {
        if self.shadow_log.len() >= 4096 {
            self.shadow_log.pop_front();
        }
        self.shadow_log.push_back(entry);
    }

    /// The four-check constraint audit (spec.md §4.3), runnable only once
    /// at least `SHADOW_MIN_DAYS` have elapsed since `shadow_start_ts`. If
    /// `all_passed`, the caller should transition the mode to `Advisory`;
    /// otherwise the shadow clock resets (no clip narrowing).
    pub fn run_constraint_audit(&mut self, now: chrono::DateTime<chrono::Utc>) -> Option<ConstraintAudit> {
        if self.mode != ResidualMode::Shadow {
            return None;
        }
        let elapsed_days = (now - self.shadow_start_ts).num_days();
        if elapsed_days < SHADOW_MIN_DAYS {
            return None;
        }

        let soc_violations = self.shadow_log.iter().filter(|e| e.would_violate_min_soc).count();
        let missed_departures = self.shadow_log.iter().filter(|e| e.would_miss_departure).count();
        let over_magnitude = self
            .shadow_log
            .iter()
            .filter(|e| e.correction.battery_delta_ct.abs() > 20.0 + 1e-9 || e.correction.ev_delta_ct.abs() > 20.0 + 1e-9)
            .count();
        let wins = self.shadow_log.iter().filter(|e| e.reward > 0.0).count();
        let total = self.shadow_log.len().max(1);
        let win_rate = wins as f64 / total as f64;

        let no_soc_violation = AuditCheck {
            passed: soc_violations == 0,
            detail: format!("{soc_violations} shadow corrections would have violated min_soc"),
        };
        let no_missed_departure = AuditCheck {
            passed: missed_departures == 0,
            detail: format!("{missed_departures} shadow corrections would have missed a departure"),
        };
        let magnitude_bounded = AuditCheck {
            passed: over_magnitude == 0,
            detail: format!("{over_magnitude} corrections exceeded 20 ct/kWh"),
        };
        let win_rate_above_half = AuditCheck {
            passed: win_rate > 0.5,
            detail: format!("rolling win-rate {:.1}%", win_rate * 100.0),
        };

        let all_passed = no_soc_violation.passed
            && no_missed_departure.passed
            && magnitude_bounded.passed
            && win_rate_above_half.passed;

        if all_passed {
            self.mode = ResidualMode::Advisory;
        } else {
            self.shadow_start_ts = now;
        }

        Some(ConstraintAudit {
            no_soc_violation,
            no_missed_departure,
            magnitude_bounded,
            win_rate_above_half,
            all_passed,
        })
    }
}

fn season_key(season: Season) -> String {
    match season {
        Season::Djf => "DJF".into(),
        Season::Mam => "MAM".into(),
        Season::Jja => "JJA".into(),
        Season::Son => "SON".into(),
    }
}

fn season_from_key(key: &str) -> Option<Season> {
    match key {
        "DJF" => Some(Season::Djf),
        "MAM" => Some(Season::Mam),
        "JJA" => Some(Season::Jja),
        "SON" => Some(Season::Son),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PricePercentiles;
    use chrono::Utc;
    use rand::SeedableRng;

    fn sample_state() -> SystemState {
        SystemState {
            grid_price_eur_per_kwh: 0.22,
            battery_soc_percent: 55.0,
            battery_power_w: 0.0,
            pv_power_w: 1200.0,
            house_load_w: 800.0,
            ev_connected: true,
            ev_name: "Kia".into(),
            ev_soc_source: Some(crate::domain::SocSource::FromApi(40.0)),
            ev_target_soc_percent: 80.0,
            ev_charge_power_w: 0.0,
            price_percentiles: PricePercentiles {
                p20: 0.10,
                p30: 0.15,
                p40: 0.18,
                p60: 0.25,
                p80: 0.32,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn discretize_is_deterministic() {
        let s = sample_state();
        assert_eq!(discretize(&s), discretize(&s));
    }

    #[test]
    fn clip_never_drives_threshold_negative() {
        let c = ResidualCorrection {
            battery_delta_ct: -20.0,
            ev_delta_ct: 0.0,
        };
        let clipped = ResidualAgent::clip_correction(c, 5.0, 5.0);
        assert!(5.0 + clipped.battery_delta_ct >= -1e-9);
    }

    #[test]
    fn select_action_explores_when_epsilon_is_one() {
        let cfg = ResidualConfig {
            enabled: true,
            epsilon_start: 1.0,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
        };
        let dir = std::path::PathBuf::from("/tmp/dispatch-core-unused");
        let agent = ResidualAgent::new(&dir, &cfg, Utc::now());
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let (action, _) = agent.select_action(&sample_state(), &mut rng);
        assert!(action < NUM_ACTIONS);
    }

    #[test]
    fn learn_increases_q_value_toward_positive_reward() {
        let cfg = ResidualConfig {
            enabled: true,
            epsilon_start: 0.1,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
        };
        let dir = std::path::PathBuf::from("/tmp/dispatch-core-unused");
        let mut agent = ResidualAgent::new(&dir, &cfg, Utc::now());
        let state = sample_state();
        let key = key_of(&discretize(&state));
        agent.learn(Season::Mam, key.clone(), 24, 1.0, &state, 0.1, 0.9);
        assert!(agent.q_table[&key][24] > 0.0);
    }

    #[test]
    fn audit_fails_before_min_shadow_days() {
        let cfg = ResidualConfig {
            enabled: true,
            epsilon_start: 0.1,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
        };
        let dir = std::path::PathBuf::from("/tmp/dispatch-core-unused");
        let mut agent = ResidualAgent::new(&dir, &cfg, Utc::now());
        assert!(agent.run_constraint_audit(Utc::now()).is_none());
    }

    #[test]
    fn audit_transitions_to_advisory_when_all_checks_pass() {
        let cfg = ResidualConfig {
            enabled: true,
            epsilon_start: 0.1,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
        };
        let dir = std::path::PathBuf::from("/tmp/dispatch-core-unused");
        let started = Utc::now() - chrono::Duration::days(31);
        let mut agent = ResidualAgent::new(&dir, &cfg, started);
        for _ in 0..10 {
            agent.log_shadow_decision(ShadowLogEntry {
                ts: Utc::now(),
                correction: ResidualCorrection::zero(),
                would_violate_min_soc: false,
                would_miss_departure: false,
                reward: 1.0,
            });
        }
        let audit = agent.run_constraint_audit(Utc::now()).unwrap();
        assert!(audit.all_passed);
        assert_eq!(agent.mode(), ResidualMode::Advisory);
    }

    #[test]
    fn audit_resets_shadow_clock_on_failure() {
        let cfg = ResidualConfig {
            enabled: true,
            epsilon_start: 0.1,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
        };
        let dir = std::path::PathBuf::from("/tmp/dispatch-core-unused");
        let started = Utc::now() - chrono::Duration::days(31);
        let mut agent = ResidualAgent::new(&dir, &cfg, started);
        agent.log_shadow_decision(ShadowLogEntry {
            ts: Utc::now(),
            correction: ResidualCorrection::zero(),
            would_violate_min_soc: true,
            would_miss_departure: false,
            reward: 1.0,
        });
        let audit = agent.run_constraint_audit(Utc::now()).unwrap();
        assert!(!audit.all_passed);
        assert_eq!(agent.mode(), ResidualMode::Shadow);
    }
}
