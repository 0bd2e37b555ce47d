//! Cross-cutting error taxonomy (spec.md §7). Every fallible operation
//! that can fail inside a cycle resolves to one of these variants instead
//! of a per-module error enum, since spec.md treats error handling as one
//! policy, not per-component plumbing.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing tariff endpoint URL, `min_soc >= max_soc`, negative
    /// capacity, efficiency outside (0, 1]. Aborts startup; no cycles run.
    #[error("critical configuration error: {0}")]
    ConfigCritical(String),

    /// Out-of-range price ceiling, missing optional token, etc.
    /// Substituted with a documented default and logged as a warning;
    /// never surfaces as an `Err` to a caller.
    #[error("non-critical configuration issue: {0}")]
    ConfigNonCritical(String),

    /// HTTP timeout, connection refused, 4xx/5xx from an adapter.
    /// Recovered with the most recent cached value; cycle continues.
    #[error("transient external failure ({source}): {detail}")]
    ExternalTransient { source: String, detail: String },

    /// An adapter has been failing for longer than the back-off cap
    /// allows; the affected input is flagged `stale` in snapshots.
    #[error("external source {source} persistently failing: {detail}")]
    ExternalPersistent { source: String, detail: String },

    /// LP solver returned non-optimal or raised. The arbitrator falls
    /// back to the static-threshold path; never propagates further.
    #[error("planner failed to produce a plan: {0}")]
    Planner(String),

    /// Override activation rejected (currently only "during quiet hours").
    #[error("override rejected: {0}")]
    Override(String),

    /// JSON persistence write or read failed. In-memory state is
    /// retained; the write is retried on the next update.
    #[error("persistence failure for {file}: {detail}")]
    Persistence { file: String, detail: String },

    /// SoC outside bounds, NaN in an action, or another invariant
    /// violation caught by a runtime check. The offending value is
    /// clipped; the cycle's learning sample is discarded.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Whether this error must abort startup (the only propagating class
    /// per spec.md §7's propagation policy).
    pub fn is_critical(&self) -> bool {
        matches!(self, CoreError::ConfigCritical(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
