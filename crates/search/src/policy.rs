//! Acceptance policy applied to the launch configuration a backend settles on.

use kernelvault_ir::CudaDim;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptancePolicy {
    pub min_threads_per_block: u64,
    pub min_blocks_per_grid: u64,
}

impl AcceptancePolicy {
    pub fn new(min_blocks_per_grid: u64) -> Self {
        Self {
            min_threads_per_block: 32,
            min_blocks_per_grid,
        }
    }

    /// Judge the tightened launch configuration, not the requested one.
    pub fn evaluate(&self, tight_block: &CudaDim, tight_grid: &CudaDim) -> Verdict {
        let threads = tight_block.product();
        if threads < self.min_threads_per_block {
            return Verdict::Rejected(RejectReason::TooFewThreads {
                threads,
                minimum: self.min_threads_per_block,
            });
        }
        let blocks = tight_grid.product();
        if blocks < self.min_blocks_per_grid {
            return Verdict::Rejected(RejectReason::TooFewBlocks {
                blocks,
                minimum: self.min_blocks_per_grid,
            });
        }
        Verdict::Accepted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    TooFewThreads { threads: u64, minimum: u64 },
    TooFewBlocks { blocks: u64, minimum: u64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::TooFewThreads { threads, minimum } => {
                write!(f, "{threads} threads per block, need {minimum}")
            }
            RejectReason::TooFewBlocks { blocks, minimum } => {
                write!(f, "{blocks} blocks per grid, need {minimum}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_are_inclusive() {
        let policy = AcceptancePolicy::new(20);
        assert!(policy
            .evaluate(&CudaDim::new(32, 1, 1), &CudaDim::new(20, 1, 1))
            .is_accepted());
        assert_eq!(
            policy.evaluate(&CudaDim::new(31, 1, 1), &CudaDim::new(20, 1, 1)),
            Verdict::Rejected(RejectReason::TooFewThreads {
                threads: 31,
                minimum: 32
            })
        );
        assert_eq!(
            policy.evaluate(&CudaDim::new(8, 4, 1), &CudaDim::new(4, 4, 1)),
            Verdict::Rejected(RejectReason::TooFewBlocks {
                blocks: 16,
                minimum: 20
            })
        );
    }

    #[test]
    fn test_reason_serializes_with_tag() {
        let reason = RejectReason::TooFewBlocks {
            blocks: 3,
            minimum: 56,
        };
        let json = serde_json::to_value(reason).unwrap();
        assert_eq!(json["reason"], "too_few_blocks");
        assert_eq!(json["blocks"], 3);
        assert_eq!(reason.to_string(), "3 blocks per grid, need 56");
    }
}
