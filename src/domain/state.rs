use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Meteorological season, used to key the seasonal learner's cells and to
/// shift the LP objective by the season's historical plan error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    /// December, January, February.
    Djf,
    /// March, April, May.
    Mam,
    /// June, July, August.
    Jja,
    /// September, October, November.
    Son,
}

impl Season {
    pub fn from_month(month: u32) -> Self {
        match month {
            12 | 1 | 2 => Season::Djf,
            3..=5 => Season::Mam,
            6..=8 => Season::Jja,
            9..=11 => Season::Son,
            _ => unreachable!("chrono month is always 1..=12"),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Season::Djf => 0,
            Season::Mam => 1,
            Season::Jja => 2,
            Season::Son => 3,
        }
    }
}

/// One of six 4-hour bands covering a day, used by the seasonal learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeBand {
    H00to04,
    H04to08,
    H08to12,
    H12to16,
    H16to20,
    H20to24,
}

impl TimeBand {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=3 => TimeBand::H00to04,
            4..=7 => TimeBand::H04to08,
            8..=11 => TimeBand::H08to12,
            12..=15 => TimeBand::H12to16,
            16..=19 => TimeBand::H16to20,
            20..=23 => TimeBand::H20to24,
            _ => unreachable!("chrono hour is always 0..=23"),
        }
    }

    pub fn index(&self) -> usize {
        match self {
            TimeBand::H00to04 => 0,
            TimeBand::H04to08 => 1,
            TimeBand::H08to12 => 2,
            TimeBand::H12to16 => 3,
            TimeBand::H16to20 => 4,
            TimeBand::H20to24 => 5,
        }
    }
}

/// Where a reported vehicle SoC came from. Replaces the free-form
/// type-checked union the source system used (see SPEC_FULL.md §9):
/// manual readings carry the time they were set so stale manual entries
/// can be distinguished from a fresh one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SocSource {
    FromApi(f64),
    FromWallbox(f64),
    Manual { value: f64, set_at: DateTime<Utc> },
}

impl SocSource {
    /// The SoC value regardless of provenance.
    pub fn effective(&self) -> f64 {
        match self {
            SocSource::FromApi(v) | SocSource::FromWallbox(v) => *v,
            SocSource::Manual { value, .. } => *value,
        }
    }
}

/// Price percentiles over the next 24h, used by the planner's objective
/// shaping and by the residual agent's state discretisation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePercentiles {
    pub p20: f64,
    pub p30: f64,
    pub p40: f64,
    pub p60: f64,
    pub p80: f64,
}

/// A periodic snapshot of the physical site at cycle time `t`.
/// Immutable after creation; produced by the data-collection adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub grid_price_eur_per_kwh: f64,
    pub battery_soc_percent: f64,
    /// Signed battery power in watts: positive charging, negative discharging.
    pub battery_power_w: f64,
    pub pv_power_w: f64,
    pub house_load_w: f64,
    pub ev_connected: bool,
    /// May be empty for one or two cycles after a vehicle connects.
    pub ev_name: String,
    pub ev_soc_source: Option<SocSource>,
    pub ev_target_soc_percent: f64,
    pub ev_charge_power_w: f64,
    pub price_percentiles: PricePercentiles,
    pub timestamp: DateTime<Utc>,
}

impl SystemState {
    pub fn season(&self) -> Season {
        Season::from_month(self.timestamp.month())
    }

    pub fn time_band(&self) -> TimeBand {
        TimeBand::from_hour(self.timestamp.hour())
    }

    pub fn is_weekend(&self) -> bool {
        matches!(
            self.timestamp.weekday(),
            chrono::Weekday::Sat | chrono::Weekday::Sun
        )
    }

    pub fn ev_soc_percent(&self) -> Option<f64> {
        self.ev_soc_source.as_ref().map(SocSource::effective)
    }
}

/// One hourly tariff entry as delivered by the (out-of-scope) tariff
/// adapter, before the planner expands it to 15-minute slots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TariffPoint {
    pub start: DateTime<Utc>,
    pub price_eur_per_kwh: f64,
}
