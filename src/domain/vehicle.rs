use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideSource {
    Dashboard,
    Messaging,
}

/// A time-limited manual "boost" command that bypasses LP control for a
/// single vehicle. At most one exists at a time; activating a new one
/// replaces any existing one ("last activation wins").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    pub vehicle_name: String,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: OverrideSource,
}

pub const OVERRIDE_LIFETIME_MINUTES: i64 = 90;

impl Override {
    pub fn new(vehicle_name: String, source: OverrideSource, now: DateTime<Utc>) -> Self {
        Self {
            vehicle_name,
            activated_at: now,
            expires_at: now + Duration::minutes(OVERRIDE_LIFETIME_MINUTES),
            source,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-vehicle confirmed departure time from driver interaction, with an
/// optional pending inquiry timestamp. Pending inquiries older than 30
/// minutes are evicted on read, not stored indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartureRecord {
    pub confirmed: Option<DateTime<Utc>>,
    pub pending_since: Option<DateTime<Utc>>,
}

pub const PENDING_INQUIRY_TIMEOUT_MINUTES: i64 = 30;

impl DepartureRecord {
    /// The pending timestamp as seen by a reader right now: `None` if it
    /// has aged past the eviction window, even though the field itself is
    /// only cleared lazily on the next write.
    pub fn pending_since_for_read(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.pending_since.filter(|ts| {
            now.signed_duration_since(*ts) < Duration::minutes(PENDING_INQUIRY_TIMEOUT_MINUTES)
        })
    }
}
