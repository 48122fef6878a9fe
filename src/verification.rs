use std::fmt;

use crate::errors::{OperatorError, OperatorResult};
use crate::interfaces::PollId;
use crate::poll::VoteMode;
use crate::vote::{integer_sqrt, VoteIntent};

/// Provenance of an untrusted result source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TallySource {
    Chain,
    Artifact,
}

impl TallySource {
    pub fn name(&self) -> &'static str {
        match self {
            TallySource::Chain => "chain",
            TallySource::Artifact => "artifact",
        }
    }
}

/// Per-option results reported by one untrusted source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedTally {
    pub source: TallySource,
    pub results: Vec<u64>,
    pub spent: Option<u64>,
}

/// Tally recomputed from the raw ballots alone; the reference every
/// observed source is diffed against. Never consults observed data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedTally {
    pub results: Vec<u64>,
    pub total_spent: u64,
    /// Under winner-take-all, whether more than one option attained the
    /// maximum raw total. The canonical winner is then the lowest index.
    pub tied: bool,
}

impl ExpectedTally {
    /// Replays the vote-weight transformation rules over every ballot.
    pub fn from_intents(
        mode: VoteMode,
        option_count: u32,
        intents: &[VoteIntent],
    ) -> OperatorResult<Self> {
        let mut results = vec![0u64; option_count as usize];
        for intent in intents {
            for vote in &intent.votes {
                if vote.option >= option_count {
                    return Err(OperatorError::Config(format!(
                        "ballot targets option {} but the poll has {option_count} options",
                        vote.option
                    )));
                }
            }
        }
        match mode {
            VoteMode::Qv => {
                let mut total_spent = 0u64;
                for intent in intents {
                    for vote in &intent.votes {
                        let effective = integer_sqrt(vote.weight);
                        if effective == 0 {
                            continue;
                        }
                        results[vote.option as usize] += effective;
                        total_spent += effective * effective;
                    }
                }
                Ok(Self {
                    results,
                    total_spent,
                    tied: false,
                })
            }
            VoteMode::NonQv => {
                let mut total_spent = 0u64;
                for intent in intents {
                    for vote in &intent.votes {
                        results[vote.option as usize] += vote.weight;
                        total_spent += vote.weight;
                    }
                }
                Ok(Self {
                    results,
                    total_spent,
                    tied: false,
                })
            }
            VoteMode::Full => {
                // Raw per-option totals first; the whole spend is then
                // attributed to the canonical winner.
                let mut totals = vec![0u64; option_count as usize];
                let mut total_spent = 0u64;
                for intent in intents {
                    for vote in &intent.votes {
                        totals[vote.option as usize] += vote.weight;
                        total_spent += vote.weight;
                    }
                }
                let max = totals.iter().copied().max().unwrap_or(0);
                let winner = totals
                    .iter()
                    .position(|&total| total == max)
                    .unwrap_or(0);
                let tied = totals.iter().filter(|&&total| total == max).count() > 1;
                if let Some(slot) = results.get_mut(winner) {
                    *slot = total_spent;
                }
                Ok(Self {
                    results,
                    total_spent,
                    tied,
                })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    /// The source could not be consulted (e.g. artifact file absent); not a
    /// failure.
    Indeterminate,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Indeterminate => "INDETERMINATE",
        }
    }
}

/// A per-option expected/observed divergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionDiff {
    pub option: u32,
    pub expected: u64,
    pub observed: u64,
}

/// Result of diffing the expected tally against one source.
#[derive(Clone, Debug)]
pub struct SourceComparison {
    pub source: TallySource,
    pub outcome: Outcome,
    pub observed: Option<ObservedTally>,
    pub mismatched_options: Vec<OptionDiff>,
    pub spend_mismatch: Option<OptionlessDiff>,
}

/// Expected/observed divergence of the spent voice-credit total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionlessDiff {
    pub expected: u64,
    pub observed: u64,
}

#[derive(Clone, Debug)]
pub struct VerificationReport {
    pub poll: PollId,
    pub mode: VoteMode,
    pub expected: ExpectedTally,
    pub chain: SourceComparison,
    pub artifact: SourceComparison,
}

impl VerificationReport {
    /// True when no consulted source diverged. Indeterminate sources do not
    /// count as failures.
    pub fn passed(&self) -> bool {
        self.chain.outcome != Outcome::Fail && self.artifact.outcome != Outcome::Fail
    }
}

/// Recomputes the expected tally from the complete ballot set and diffs it
/// against both untrusted sources independently. Pure computation; the
/// caller fetches all observed data beforehand.
///
/// `expected_ballots` is the number of ballots the protocol accepted;
/// verification refuses partial history.
pub fn verify(
    poll: PollId,
    mode: VoteMode,
    option_count: u32,
    intents: &[VoteIntent],
    expected_ballots: usize,
    chain: Option<ObservedTally>,
    artifact: Option<ObservedTally>,
) -> OperatorResult<VerificationReport> {
    if intents.len() != expected_ballots {
        return Err(OperatorError::IncompleteVoteSet {
            expected: expected_ballots,
            actual: intents.len(),
        });
    }
    let expected = ExpectedTally::from_intents(mode, option_count, intents)?;
    let chain = compare(&expected, TallySource::Chain, chain);
    let artifact = compare(&expected, TallySource::Artifact, artifact);
    Ok(VerificationReport {
        poll,
        mode,
        expected,
        chain,
        artifact,
    })
}

fn compare(
    expected: &ExpectedTally,
    source: TallySource,
    observed: Option<ObservedTally>,
) -> SourceComparison {
    let Some(observed) = observed else {
        return SourceComparison {
            source,
            outcome: Outcome::Indeterminate,
            observed: None,
            mismatched_options: Vec::new(),
            spend_mismatch: None,
        };
    };
    let mismatched_options: Vec<OptionDiff> = expected
        .results
        .iter()
        .enumerate()
        .filter_map(|(index, &value)| {
            let reported = observed.results.get(index).copied().unwrap_or(0);
            (reported != value).then_some(OptionDiff {
                option: index as u32,
                expected: value,
                observed: reported,
            })
        })
        .collect();
    let spend_mismatch = observed.spent.and_then(|spent| {
        (spent != expected.total_spent).then_some(OptionlessDiff {
            expected: expected.total_spent,
            observed: spent,
        })
    });
    let outcome = if mismatched_options.is_empty() && spend_mismatch.is_none() {
        Outcome::Pass
    } else {
        Outcome::Fail
    };
    SourceComparison {
        source,
        outcome,
        observed: Some(observed),
        mismatched_options,
        spend_mismatch,
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "tally verification for poll {} (mode: {})",
            self.poll,
            self.mode.name()
        )?;
        if self.mode == VoteMode::Full && self.tied() {
            writeln!(
                f,
                "  note: winner totals were tied; lowest option index selected"
            )?;
        }
        for comparison in [&self.chain, &self.artifact] {
            write_comparison(f, &self.expected, comparison)?;
        }
        write!(
            f,
            "overall: {}",
            if self.passed() { "PASS" } else { "FAIL" }
        )
    }
}

impl VerificationReport {
    fn tied(&self) -> bool {
        self.expected.tied
    }
}

fn write_comparison(
    f: &mut fmt::Formatter<'_>,
    expected: &ExpectedTally,
    comparison: &SourceComparison,
) -> fmt::Result {
    writeln!(
        f,
        "  source {}: {}",
        comparison.source.name(),
        comparison.outcome.name()
    )?;
    let Some(observed) = &comparison.observed else {
        writeln!(f, "    no tally data available from this source")?;
        return Ok(());
    };
    for (index, &value) in expected.results.iter().enumerate() {
        let reported = observed.results.get(index).copied().unwrap_or(0);
        let marker = if reported == value { "ok" } else { "MISMATCH" };
        writeln!(
            f,
            "    option {index}: expected {value}, observed {reported} [{marker}]"
        )?;
    }
    match observed.spent {
        Some(spent) => {
            let marker = if spent == expected.total_spent {
                "ok"
            } else {
                "MISMATCH"
            };
            writeln!(
                f,
                "    total spent: expected {}, observed {spent} [{marker}]",
                expected.total_spent
            )?;
        }
        None => writeln!(
            f,
            "    total spent: expected {}, not reported",
            expected.total_spent
        )?,
    }
    Ok(())
}
