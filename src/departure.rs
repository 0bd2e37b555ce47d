//! Departure-time store (C9, spec.md §4.4/§8): per-vehicle confirmed
//! departure times from driver interaction, JSON-persistent. Pending
//! inquiries older than 30 minutes are silently evicted on read.
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::DepartureRecord;
use crate::error::CoreResult;
use crate::persistence;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFile {
    version: u32,
    confirmed: HashMap<String, DateTime<Utc>>,
    pending: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct DepartureStore {
    records: HashMap<String, DepartureRecord>,
    path: PathBuf,
}

impl DepartureStore {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            records: HashMap::new(),
            path: data_dir.join("departure_times.json"),
        }
    }

    pub async fn load(data_dir: &std::path::Path) -> CoreResult<Self> {
        let mut store = Self::new(data_dir);
        if let Some(file) = persistence::load_if_present::<PersistedFile>(&store.path).await? {
            if file.version == 1 {
                let mut names: Vec<String> = file.confirmed.keys().cloned().collect();
                names.extend(file.pending.keys().cloned());
                names.sort();
                names.dedup();
                for name in names {
                    store.records.insert(
                        name.clone(),
                        DepartureRecord {
                            confirmed: file.confirmed.get(&name).copied(),
                            pending_since: file.pending.get(&name).copied(),
                        },
                    );
                }
            }
        }
        Ok(store)
    }

    pub async fn save(&self) -> CoreResult<()> {
        let mut confirmed = HashMap::new();
        let mut pending = HashMap::new();
        for (name, record) in &self.records {
            if let Some(ts) = record.confirmed {
                confirmed.insert(name.clone(), ts);
            }
            if let Some(ts) = record.pending_since {
                pending.insert(name.clone(), ts);
            }
        }
        persistence::save_atomic(
            &self.path,
            &PersistedFile {
                version: 1,
                confirmed,
                pending,
            },
        )
        .await
    }

    /// Record a driver-confirmed departure time, clearing any pending
    /// inquiry for the vehicle.
    pub fn confirm(&mut self, vehicle_name: &str, departure: DateTime<Utc>) {
        let record = self.records.entry(vehicle_name.to_string()).or_insert(DepartureRecord {
            confirmed: None,
            pending_since: None,
        });
        record.confirmed = Some(departure);
        record.pending_since = None;
    }

    /// Mark that the system asked the driver for a departure time and is
    /// waiting on an answer.
    pub fn mark_pending(&mut self, vehicle_name: &str, now: DateTime<Utc>) {
        let record = self.records.entry(vehicle_name.to_string()).or_insert(DepartureRecord {
            confirmed: None,
            pending_since: None,
        });
        record.pending_since = Some(now);
    }

    /// The confirmed departure time, if any, with the spec's eviction
    /// policy applied to the pending flag on read.
    pub fn confirmed_departure(&self, vehicle_name: &str) -> Option<DateTime<Utc>> {
        self.records.get(vehicle_name).and_then(|r| r.confirmed)
    }

    /// Whether a not-yet-stale pending inquiry exists for this vehicle.
    pub fn has_pending_inquiry(&self, vehicle_name: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(vehicle_name)
            .and_then(|r| r.pending_since_for_read(now))
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_clears_pending() {
        let mut store = DepartureStore::new(std::path::Path::new("/tmp/dispatch-core-unused"));
        let now = Utc::now();
        store.mark_pending("Kia", now);
        assert!(store.has_pending_inquiry("Kia", now));
        store.confirm("Kia", now + chrono::Duration::hours(3));
        assert!(!store.has_pending_inquiry("Kia", now));
        assert!(store.confirmed_departure("Kia").is_some());
    }

    #[test]
    fn pending_older_than_thirty_minutes_is_evicted_on_read() {
        let mut store = DepartureStore::new(std::path::Path::new("/tmp/dispatch-core-unused"));
        let now = Utc::now();
        store.mark_pending("Kia", now);
        let later = now + chrono::Duration::minutes(31);
        assert!(!store.has_pending_inquiry("Kia", later));
    }

    #[tokio::test]
    async fn round_trip_preserves_confirmed_and_pending() {
        let dir = std::env::temp_dir().join(format!("dispatch-core-dep-{}", std::process::id()));
        let mut store = DepartureStore::new(&dir);
        let now = Utc::now();
        store.confirm("Kia", now + chrono::Duration::hours(2));
        store.mark_pending("Tesla", now);
        store.save().await.unwrap();

        let reloaded = DepartureStore::load(&dir).await.unwrap();
        assert!(reloaded.confirmed_departure("Kia").is_some());
        assert!(reloaded.has_pending_inquiry("Tesla", now));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
