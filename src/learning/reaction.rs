//! Reaction-timing tracker (C4, spec.md §4.3): an EMA over "did the
//! previous deviation self-correct?" that decides whether the arbitration
//! loop should replan immediately rather than wait for the next scheduled
//! cycle.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::persistence;

const EMA_ALPHA: f64 = 0.05;
const REPLAN_THRESHOLD: f64 = 0.6;
const INITIAL_EMA: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    ema: f64,
    threshold: f64,
}

#[derive(Debug, Clone)]
pub struct ReactionTimingTracker {
    ema: f64,
    threshold: f64,
    path: PathBuf,
}

impl ReactionTimingTracker {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            ema: INITIAL_EMA,
            threshold: REPLAN_THRESHOLD,
            path: data_dir.join("reaction_timing.json"),
        }
    }

    pub async fn load(data_dir: &std::path::Path) -> CoreResult<Self> {
        let mut tracker = Self::new(data_dir);
        if let Some(file) = persistence::load_if_present::<PersistedFile>(&tracker.path).await? {
            if file.version == 1 {
                tracker.ema = file.ema;
                tracker.threshold = file.threshold;
            }
        }
        Ok(tracker)
    }

    pub async fn save(&self) -> CoreResult<()> {
        persistence::save_atomic(
            &self.path,
            &PersistedFile {
                version: 1,
                ema: self.ema,
                threshold: self.threshold,
            },
        )
        .await
    }

    /// Update the EMA with whether the last cycle's deviation self-corrected.
    pub fn observe(&mut self, self_corrected: bool) {
        let sample = if self_corrected { 1.0 } else { 0.0 };
        self.ema = EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * self.ema;
    }

    /// `true` when deviations seldom self-correct (EMA below threshold),
    /// meaning the arbitrator should schedule a replan on the next tick
    /// rather than wait out the full cycle.
    pub fn should_replan_immediately(&self) -> bool {
        self.ema < self.threshold
    }

    pub fn ema(&self) -> f64 {
        self.ema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_starts_below_threshold_and_replans() {
        let tracker = ReactionTimingTracker::new(std::path::Path::new("/tmp/dispatch-core-unused"));
        assert!(tracker.should_replan_immediately());
    }

    #[test]
    fn repeated_non_self_correction_trips_replan() {
        let mut tracker =
            ReactionTimingTracker::new(std::path::Path::new("/tmp/dispatch-core-unused"));
        for _ in 0..50 {
            tracker.observe(false);
        }
        assert!(tracker.should_replan_immediately());
    }

    #[tokio::test]
    async fn round_trip_preserves_ema() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-react-{}", std::process::id()));
        let mut tracker = ReactionTimingTracker::new(&dir);
        tracker.observe(false);
        tracker.observe(false);
        tracker.save().await.unwrap();
        let reloaded = ReactionTimingTracker::load(&dir).await.unwrap();
        assert!((reloaded.ema() - tracker.ema()).abs() < 1e-12);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
