//! Charge sequencer (C10, spec.md §4.4 step 9): ranks competing vehicles
//! for the single shared wallbox by urgency and serialises access to it.
use serde::{Deserialize, Serialize};

/// One vehicle in contention for the wallbox this cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleCandidate {
    pub name: String,
    pub soc_percent: f64,
    pub target_soc_percent: f64,
    pub hours_to_departure: f64,
    pub currently_connected: bool,
}

impl VehicleCandidate {
    fn soc_deficit_percent(&self) -> f64 {
        (self.target_soc_percent - self.soc_percent).max(0.0)
    }

    /// `soc_deficit_% / max(0.5, hours_to_departure)`, plus +5.0 if already
    /// connected (avoid wallbox swap churn) and +1000.0 during quiet hours
    /// for the already-connected vehicle (hard priority), per spec.md §4.4.
    pub fn urgency(&self, quiet_hours_active: bool) -> f64 {
        let mut urgency = self.soc_deficit_percent() / self.hours_to_departure.max(0.5);
        if self.currently_connected {
            urgency += 5.0;
            if quiet_hours_active {
                urgency += 1000.0;
            }
        }
        urgency
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerSummary {
    pub target: Option<String>,
    pub ranking: Vec<(String, f64)>,
}

/// Choose the highest-urgency vehicle among `candidates`, or `None` if the
/// list is empty. Ties favour the currently-connected vehicle since its
/// urgency already carries the churn-avoidance bonus.
pub fn select_target(candidates: &[VehicleCandidate], quiet_hours_active: bool) -> SequencerSummary {
    let mut ranking: Vec<(String, f64)> = candidates
        .iter()
        .map(|c| (c.name.clone(), c.urgency(quiet_hours_active)))
        .collect();
    ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    SequencerSummary {
        target: ranking.first().map(|(name, _)| name.clone()),
        ranking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_wins_over_soc_deficit_alone() {
        let a = VehicleCandidate {
            name: "A".into(),
            soc_percent: 50.0,
            target_soc_percent: 80.0,
            hours_to_departure: 2.0,
            currently_connected: false,
        };
        let b = VehicleCandidate {
            name: "B".into(),
            soc_percent: 40.0,
            target_soc_percent: 80.0,
            hours_to_departure: 12.0,
            currently_connected: false,
        };
        assert!((a.urgency(false) - 15.0).abs() < 1e-9);
        assert!((b.urgency(false) - 3.333_333_333_333_333).abs() < 1e-9);

        let summary = select_target(&[a, b], false);
        assert_eq!(summary.target.as_deref(), Some("A"));
    }

    #[test]
    fn connected_vehicle_gets_quiet_hours_hard_priority() {
        let connected = VehicleCandidate {
            name: "Connected".into(),
            soc_percent: 70.0,
            target_soc_percent: 80.0,
            hours_to_departure: 10.0,
            currently_connected: true,
        };
        let urgent = VehicleCandidate {
            name: "Urgent".into(),
            soc_percent: 10.0,
            target_soc_percent: 90.0,
            hours_to_departure: 1.0,
            currently_connected: false,
        };
        let summary = select_target(&[connected, urgent], true);
        assert_eq!(summary.target.as_deref(), Some("Connected"));
    }

    #[test]
    fn empty_candidate_list_yields_no_target() {
        let summary = select_target(&[], false);
        assert!(summary.target.is_none());
    }
}
