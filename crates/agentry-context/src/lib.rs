pub mod compactor;
pub mod estimator;

pub use compactor::{CompactionConfig, CompactionOutcome, Compactor, COMPACTION_PROMPT};
pub use estimator::{HeuristicEstimator, TokenEstimator, MESSAGE_OVERHEAD_TOKENS};
