use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The seven signed ct/kWh deltas the residual agent may apply to either
/// threshold; action index is `battery_idx * 7 + ev_idx`.
pub const CORRECTION_STEPS_CT: [f64; 7] = [-20.0, -10.0, -5.0, 0.0, 5.0, 10.0, 20.0];
pub const NUM_CORRECTION_STEPS: usize = CORRECTION_STEPS_CT.len();
pub const NUM_ACTIONS: usize = NUM_CORRECTION_STEPS * NUM_CORRECTION_STEPS;

/// A signed ct/kWh correction pair the residual agent proposes for the
/// current cycle's LP price thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualCorrection {
    pub battery_delta_ct: f64,
    pub ev_delta_ct: f64,
}

impl ResidualCorrection {
    pub fn from_action_index(action: usize) -> Self {
        let battery_idx = action / NUM_CORRECTION_STEPS;
        let ev_idx = action % NUM_CORRECTION_STEPS;
        Self {
            battery_delta_ct: CORRECTION_STEPS_CT[battery_idx],
            ev_delta_ct: CORRECTION_STEPS_CT[ev_idx],
        }
    }

    pub fn zero() -> Self {
        Self {
            battery_delta_ct: 0.0,
            ev_delta_ct: 0.0,
        }
    }
}

/// Residual RL agent operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualMode {
    /// Corrections are computed and logged but never applied.
    Shadow,
    /// Corrections actually perturb the LP price thresholds.
    Advisory,
}

impl Default for ResidualMode {
    fn default() -> Self {
        ResidualMode::Shadow
    }
}

/// Accumulator for one `(season, time_band, weekend)` cell of the seasonal
/// plan-error table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SeasonalCell {
    pub sum_error_eur: f64,
    pub count: u32,
}

impl SeasonalCell {
    pub fn mean_error(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum_error_eur / self.count as f64)
        }
    }

    pub fn add_sample(&mut self, error_eur: f64) {
        self.sum_error_eur += error_eur;
        self.count += 1;
    }
}

/// Per-source rolling absolute-error window feeding a confidence scalar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityWindow {
    pub errors: VecDeque<f64>,
    pub capacity: usize,
    pub reference_scale: f64,
}

impl ReliabilityWindow {
    pub fn new(reference_scale: f64) -> Self {
        Self {
            errors: VecDeque::with_capacity(50),
            capacity: 50,
            reference_scale,
        }
    }

    pub fn push(&mut self, absolute_error: f64) {
        if self.errors.len() >= self.capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(absolute_error);
    }

    /// Confidence in `[0, 1]`. Fewer than 5 samples are assumed reliable
    /// (confidence 1.0) since there isn't yet enough signal to distrust
    /// the source.
    pub fn confidence(&self) -> f64 {
        if self.errors.len() < 5 {
            return 1.0;
        }
        let mean: f64 = self.errors.iter().sum::<f64>() / self.errors.len() as f64;
        (1.0 - mean / self.reference_scale).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionCategory {
    Observe,
    Plan,
    Action,
    Warning,
    Rl,
    Sequencer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub category: DecisionCategory,
    pub icon: &'static str,
    pub text: String,
    pub details: Option<serde_json::Value>,
}

/// Bounded ring buffer of decision-log entries, oldest dropped first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLog {
    entries: VecDeque<DecisionLogEntry>,
    capacity: usize,
}

impl DecisionLog {
    /// `capacity` is honoured exactly as given; spec.md §3's "ring buffer
    /// (>= 40 entries)" is a guideline for the production default the state
    /// store constructs with (see `state::DECISION_LOG_CAPACITY`), not a
    /// floor this constructor silently imposes on every caller.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: DecisionLogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &DecisionLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_correction_action_index_round_trips() {
        for action in 0..NUM_ACTIONS {
            let c = ResidualCorrection::from_action_index(action);
            assert!(CORRECTION_STEPS_CT.contains(&c.battery_delta_ct));
            assert!(CORRECTION_STEPS_CT.contains(&c.ev_delta_ct));
        }
    }

    #[test]
    fn seasonal_cell_mean_error_requires_samples() {
        let cell = SeasonalCell::default();
        assert_eq!(cell.mean_error(), None);
    }

    #[test]
    fn reliability_window_low_sample_count_is_confident() {
        let mut w = ReliabilityWindow::new(5.0);
        w.push(4.9);
        assert_eq!(w.confidence(), 1.0);
    }

    #[test]
    fn reliability_window_confidence_bounds() {
        let mut w = ReliabilityWindow::new(5.0);
        for _ in 0..10 {
            w.push(0.0);
        }
        assert!((w.confidence() - 1.0).abs() < 1e-9);

        let mut w2 = ReliabilityWindow::new(5.0);
        for _ in 0..10 {
            w2.push(50.0);
        }
        assert_eq!(w2.confidence(), 0.0);
    }

    #[test]
    fn decision_log_drops_oldest_when_full() {
        let mut log = DecisionLog::new(2);
        for i in 0..5 {
            log.push(DecisionLogEntry {
                ts: chrono::Utc::now(),
                category: DecisionCategory::Observe,
                icon: "i",
                text: format!("entry {i}"),
                details: None,
            });
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries().next().unwrap().text, "entry 3");
    }
}
