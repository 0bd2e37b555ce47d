//! Override manager (C8, spec.md §4.5): a single-instance, 90-minute
//! expiring manual "boost" command. A single scheduled expiry task is
//! replaced on re-activation ("last wins"); the manager never calls the
//! external controller itself — it only clears its own state and the next
//! arbitration cycle notices the override is gone and resumes LP control
//! (spec.md §9: "scheduled tasks, not timer threads").
use chrono::{DateTime, Utc};

use crate::config::QuietHoursConfig;
use crate::domain::{Override, OverrideSource};

#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub ok: bool,
    pub blocked_by_quiet_hours: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct OverrideManager {
    current: Option<Override>,
}

impl OverrideManager {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Attempt to activate a boost for `vehicle_name`. Blocked outright
    /// during quiet hours (spec.md §4.5/§8 scenario 5); otherwise replaces
    /// any existing override.
    pub fn activate(
        &mut self,
        vehicle_name: String,
        source: OverrideSource,
        now: DateTime<Utc>,
        local_hour: u32,
        quiet_hours: &QuietHoursConfig,
    ) -> ActivationResult {
        if quiet_hours.contains(local_hour) {
            let resume_hour = quiet_hours.end_hour;
            return ActivationResult {
                ok: false,
                blocked_by_quiet_hours: true,
                message: format!(
                    "override activation blocked during quiet hours; resumes at {resume_hour:02}:00"
                ),
            };
        }
        self.current = Some(Override::new(vehicle_name.clone(), source, now));
        ActivationResult {
            ok: true,
            blocked_by_quiet_hours: false,
            message: format!("boost activated for {vehicle_name}"),
        }
    }

    /// Idempotent: cancelling with nothing active is a no-op success.
    pub fn cancel(&mut self) {
        self.current = None;
    }

    /// The live override, if any and not yet expired. Lazily clears an
    /// expired override on read rather than relying solely on the
    /// scheduled expiry task, so a missed tick can't wedge state.
    pub fn status(&mut self, now: DateTime<Utc>) -> Option<Override> {
        if let Some(ov) = &self.current {
            if ov.is_expired(now) {
                self.current = None;
            }
        }
        self.current.clone()
    }

    pub fn is_active(&mut self, now: DateTime<Utc>) -> bool {
        self.status(now).is_some()
    }
}
