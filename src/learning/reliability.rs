//! Forecast-reliability tracker (C2). Per source, a rolling
//! window of absolute forecast errors collapses to a confidence scalar in
//! `[0, 1]` that the planner uses to shade the LP price input and to widen
//! or narrow how conservatively it plans.
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::ReliabilityWindow;
use crate::error::CoreResult;
use crate::persistence;

/// The three forecast sources this tracker covers, with their reference
/// scales: `pv=5.0 kW`, `consumption=2.0 kW`, `price=0.10 EUR/kWh`. Callers
/// must convert to these units before pushing a sample — the PV source in
/// particular is responsible for converting to kW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForecastSource {
    Pv,
    Consumption,
    Price,
}

impl ForecastSource {
    fn reference_scale(&self) -> f64 {
        match self {
            ForecastSource::Pv => 5.0,
            ForecastSource::Consumption => 2.0,
            ForecastSource::Price => 0.10,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            ForecastSource::Pv => "pv",
            ForecastSource::Consumption => "consumption",
            ForecastSource::Price => "price",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    windows: HashMap<String, Vec<f64>>,
}

/// Owns one `ReliabilityWindow` per source. Thin data holder: the state
/// store wraps it behind its mutex, so these methods take `&mut self`
/// rather than doing their own internal locking.
#[derive(Debug)]
pub struct ReliabilityTracker {
    windows: HashMap<ForecastSource, ReliabilityWindow>,
    path: PathBuf,
}

impl ReliabilityTracker {
    pub fn new(data_dir: &std::path::Path) -> Self {
        let mut windows = HashMap::new();
        for source in [
            ForecastSource::Pv,
            ForecastSource::Consumption,
            ForecastSource::Price,
        ] {
            windows.insert(source, ReliabilityWindow::new(source.reference_scale()));
        }
        Self {
            windows,
            path: data_dir.join("forecast_reliability.json"),
        }
    }

    /// Load from disk if present; a missing file is a fresh install, not
    /// an error. A version mismatch starts fresh (nothing else depends on
    /// history surviving a format change).
    pub async fn load(data_dir: &std::path::Path) -> CoreResult<Self> {
        let mut tracker = Self::new(data_dir);
        if let Some(file) = persistence::load_if_present::<PersistedFile>(&tracker.path).await? {
            if file.version == 1 {
                for source in [
                    ForecastSource::Pv,
                    ForecastSource::Consumption,
                    ForecastSource::Price,
                ] {
                    if let Some(errors) = file.windows.get(source.key()) {
                        let window = tracker.windows.get_mut(&source).unwrap();
                        for e in errors {
                            window.push(*e);
                        }
                    }
                }
            }
        }
        Ok(tracker)
    }

    pub async fn save(&self) -> CoreResult<()> {
        let mut windows = HashMap::new();
        for source in [
            ForecastSource::Pv,
            ForecastSource::Consumption,
            ForecastSource::Price,
        ] {
            windows.insert(
                source.key().to_string(),
                self.windows[&source].errors.iter().copied().collect(),
            );
        }
        persistence::save_atomic(&self.path, &PersistedFile { version: 1, windows }).await
    }

    /// Push `|actual - forecast|` for `source`, already normalised to the
    /// source's reference unit.
    pub fn update(&mut self, source: ForecastSource, forecast: f64, actual: f64) {
        let window = self.windows.get_mut(&source).expect("all sources seeded");
        window.push((actual - forecast).abs());
    }

    /// Confidence in `[0, 1]`. Fewer than 5 samples returns 1.0 (assume
    /// reliable).
    pub fn confidence(&self, source: ForecastSource) -> f64 {
        self.windows[&source].confidence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_is_fully_confident() {
        let tracker = ReliabilityTracker::new(std::path::Path::new("/tmp/dispatch-core-unused"));
        assert_eq!(tracker.confidence(ForecastSource::Pv), 1.0);
    }

    #[test]
    fn large_errors_tank_confidence() {
        let mut tracker =
            ReliabilityTracker::new(std::path::Path::new("/tmp/dispatch-core-unused"));
        for _ in 0..10 {
            tracker.update(ForecastSource::Pv, 0.0, 10.0);
        }
        assert_eq!(tracker.confidence(ForecastSource::Pv), 0.0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_errors() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-rel-{}", std::process::id()));
        let mut tracker = ReliabilityTracker::new(&dir);
        tracker.update(ForecastSource::Price, 0.10, 0.12);
        tracker.save().await.unwrap();

        let reloaded = ReliabilityTracker::load(&dir).await.unwrap();
        assert!((reloaded.confidence(ForecastSource::Price) - tracker.confidence(ForecastSource::Price)).abs() < 1e-9);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
