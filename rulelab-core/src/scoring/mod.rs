//! Pure scoring functions: weighted entry scores and prioritized exit reasons.

pub mod entry;
pub mod exit;

pub use entry::{
    ComponentScores, EntryConfig, EntryScore, EntryScorer, EntryWeights, GateAction,
    RegimeGatePolicy,
};
pub use exit::{ExitConfig, ExitSignal, ExitSignalChecker, ProtectiveLevels};
