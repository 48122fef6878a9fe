use serde::{Deserialize, Serialize};

/// Vote accounting mode for a poll. Closed set; every consumer matches
/// exhaustively instead of dispatching on untyped mode numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoteMode {
    /// Quadratic voting: casting `n` effective votes on one option costs
    /// `n^2` voice credits.
    #[default]
    Qv,
    /// Linear voting: weights pass through unchanged, cost equals weight.
    NonQv,
    /// Winner-take-all: a ballot may target a single option only.
    Full,
}

impl VoteMode {
    pub fn name(&self) -> &'static str {
        match self {
            VoteMode::Qv => "qv",
            VoteMode::NonQv => "non-qv",
            VoteMode::Full => "full",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            VoteMode::Qv => 0,
            VoteMode::NonQv => 1,
            VoteMode::Full => 2,
        }
    }
}

/// Circuit tree-depth parameters a poll is provisioned with. The verifying
/// keys registered for a poll are keyed by these values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDepths {
    pub state_tree_depth: u32,
    pub tally_processing_state_tree_depth: u32,
    pub vote_option_tree_depth: u32,
    pub message_batch_size: u32,
}

impl TreeDepths {
    /// Maximum number of vote options the quinary option tree can hold.
    pub fn vote_option_capacity(&self) -> u64 {
        5u64.saturating_pow(self.vote_option_tree_depth)
    }
}

impl Default for TreeDepths {
    fn default() -> Self {
        Self {
            state_tree_depth: 10,
            tally_processing_state_tree_depth: 1,
            vote_option_tree_depth: 2,
            message_batch_size: 25,
        }
    }
}

/// One ballot option: a human-readable label plus an opaque metadata blob
/// that the operator forwards without interpreting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub label: String,
    pub info: Vec<u8>,
}

/// Fully resolved poll parameters. Produced once by
/// [`crate::config::OperatorConfig::resolve`] and never mutated afterwards;
/// any change in timing or mode requires a new resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    pub name: String,
    pub options: Vec<PollOption>,
    pub start_time: u64,
    pub end_time: u64,
    pub mode: VoteMode,
    pub tree_depths: TreeDepths,
    pub coordinator_public_key: String,
    pub relayers: Vec<String>,
}

impl PollSpec {
    pub fn option_count(&self) -> u32 {
        self.options.len() as u32
    }

    pub fn is_over(&self, now: u64) -> bool {
        now >= self.end_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_option_capacity_is_quinary() {
        let depths = TreeDepths {
            vote_option_tree_depth: 2,
            ..TreeDepths::default()
        };
        assert_eq!(depths.vote_option_capacity(), 25);
        let deep = TreeDepths {
            vote_option_tree_depth: 3,
            ..TreeDepths::default()
        };
        assert_eq!(deep.vote_option_capacity(), 125);
    }

    #[test]
    fn mode_defaults_to_qv() {
        assert_eq!(VoteMode::default(), VoteMode::Qv);
    }
}
