//! Residual learning subsystem (spec.md §4.3): the forecast-reliability
//! tracker (C2), seasonal plan-error table (C3), reaction-timing classifier
//! (C4) and the residual RL agent itself (C5). Each owns its own JSON
//! persistence file under `data_dir` per spec.md §6.
pub mod reaction;
pub mod reliability;
pub mod residual;
pub mod seasonal;

pub use reaction::ReactionTimingTracker;
pub use reliability::ReliabilityTracker;
pub use residual::ResidualAgent;
pub use seasonal::SeasonalLearner;
