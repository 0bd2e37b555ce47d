//! Seasonal plan-error table (C3, spec.md §4.3): a 48-cell running mean of
//! `actual_cost - plan_cost` keyed by `(season, time band, weekend)`, used
//! to shift the LP objective by a learned seasonal correction.
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::{Season, SeasonalCell, TimeBand};
use crate::error::CoreResult;
use crate::persistence;

/// `(season, band, weekend)` flattened to a stable string key so the
/// persisted JSON's `map<key_string, cell>` shape (spec.md §6) survives a
/// round trip without relying on tuple-as-map-key serde quirks.
fn cell_key(season: Season, band: TimeBand, weekend: bool) -> String {
    format!("{}-{}-{}", season.index(), band.index(), weekend as u8)
}

const TOTAL_CELLS: usize = 4 * 6 * 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    cells: HashMap<String, SeasonalCell>,
}

#[derive(Debug)]
pub struct SeasonalLearner {
    cells: HashMap<String, SeasonalCell>,
    path: PathBuf,
    updates_since_save: u32,
}

impl SeasonalLearner {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            cells: HashMap::with_capacity(TOTAL_CELLS),
            path: data_dir.join("seasonal_model.json"),
            updates_since_save: 0,
        }
    }

    pub async fn load(data_dir: &std::path::Path) -> CoreResult<Self> {
        let mut learner = Self::new(data_dir);
        if let Some(file) = persistence::load_if_present::<PersistedFile>(&learner.path).await? {
            if file.version == 1 {
                learner.cells = file.cells;
            }
        }
        Ok(learner)
    }

    /// Accumulate `plan_error = actual_cost - plan_cost` (EUR) into the
    /// cell for `(season, band, weekend)`. Flushes to disk every 10 calls
    /// (spec.md §4.3 "atomic JSON persistence every 10 updates"); callers
    /// that want a forced flush (e.g. on shutdown) should call `save`
    /// directly.
    pub async fn record(
        &mut self,
        season: Season,
        band: TimeBand,
        weekend: bool,
        plan_error_eur: f64,
    ) -> CoreResult<()> {
        let key = cell_key(season, band, weekend);
        self.cells.entry(key).or_default().add_sample(plan_error_eur);
        self.updates_since_save += 1;
        if self.updates_since_save >= 10 {
            self.updates_since_save = 0;
            self.save().await?;
        }
        Ok(())
    }

    pub async fn save(&self) -> CoreResult<()> {
        persistence::save_atomic(
            &self.path,
            &PersistedFile {
                version: 1,
                cells: self.cells.clone(),
            },
        )
        .await
    }

    /// `EUR/kWh` offset applied to the LP objective (§4.1), or `None` when
    /// the cell hasn't accumulated `min_samples` observations yet.
    pub fn get_correction_factor(
        &self,
        season: Season,
        band: TimeBand,
        weekend: bool,
        min_samples: u32,
    ) -> Option<f64> {
        let key = cell_key(season, band, weekend);
        self.cells.get(&key).and_then(|cell| {
            if cell.count < min_samples {
                None
            } else {
                cell.mean_error()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cells_below_min_samples_return_none() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-seas-{}", std::process::id()));
        let mut learner = SeasonalLearner::new(&dir);
        for _ in 0..5 {
            learner
                .record(Season::Djf, TimeBand::H00to04, false, 0.5)
                .await
                .unwrap();
        }
        assert_eq!(
            learner.get_correction_factor(Season::Djf, TimeBand::H00to04, false, 10),
            None
        );
        assert!(learner
            .get_correction_factor(Season::Djf, TimeBand::H00to04, false, 5)
            .is_some());
    }

    #[tokio::test]
    async fn save_flushes_every_ten_updates() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-seas2-{}", std::process::id()));
        let mut learner = SeasonalLearner::new(&dir);
        for _ in 0..10 {
            learner
                .record(Season::Jja, TimeBand::H12to16, true, 0.1)
                .await
                .unwrap();
        }
        assert!(tokio::fs::metadata(&learner.path).await.is_ok());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn round_trip_preserves_cell_contents() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-seas3-{}", std::process::id()));
        let mut learner = SeasonalLearner::new(&dir);
        learner
            .record(Season::Son, TimeBand::H20to24, false, 1.25)
            .await
            .unwrap();
        learner.save().await.unwrap();
        let reloaded = SeasonalLearner::load(&dir).await.unwrap();
        assert_eq!(
            reloaded.get_correction_factor(Season::Son, TimeBand::H20to24, false, 1),
            Some(1.25)
        );
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
