use ed25519_dalek::{Keypair, PublicKey, Signature};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{sign_message, verify_signature};
use crate::errors::{OperatorError, OperatorResult};
use crate::interfaces::{PollId, StateIndex};
use crate::poll::{PollSpec, VoteMode};

/// One raw `(option, weight)` pair as requested by a voter, before any
/// mode transformation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightedVote {
    pub option: u32,
    pub weight: u64,
}

/// A voter's raw ballot for one poll. Weights are the requested values; the
/// builder applies the poll mode's transformation when producing commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteIntent {
    pub votes: Vec<WeightedVote>,
}

impl VoteIntent {
    /// Parses the `"option:weight,option:weight"` ballot notation, e.g.
    /// `"0:5,1:10"`. Weights must be positive.
    pub fn parse(input: &str) -> OperatorResult<Self> {
        let mut votes = Vec::new();
        for entry in input.split(',') {
            let entry = entry.trim();
            let (option_str, weight_str) = entry.split_once(':').ok_or_else(|| {
                OperatorError::Config(format!(
                    "invalid vote entry {entry:?}: expected option:weight"
                ))
            })?;
            let option = option_str.trim().parse::<u32>().map_err(|err| {
                OperatorError::Config(format!("invalid option index {option_str:?}: {err}"))
            })?;
            let weight = weight_str.trim().parse::<u64>().map_err(|err| {
                OperatorError::Config(format!("invalid vote weight {weight_str:?}: {err}"))
            })?;
            if weight == 0 {
                return Err(OperatorError::Config(format!(
                    "vote weight must be positive in entry {entry:?}"
                )));
            }
            votes.push(WeightedVote { option, weight });
        }
        Ok(Self { votes })
    }
}

/// One signed per-option vote instruction. Immutable once built; batches
/// are submitted in exactly the order returned by [`build_vote_batch`].
#[derive(Clone, Debug)]
pub struct VoteCommand {
    pub state_index: StateIndex,
    pub option: u32,
    /// Effective weight after the poll mode's transformation.
    pub weight: u64,
    pub nonce: u64,
    pub poll: PollId,
    pub salt: [u8; 32],
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl VoteCommand {
    fn canonical_bytes(
        poll: PollId,
        state_index: StateIndex,
        option: u32,
        weight: u64,
        nonce: u64,
        salt: &[u8; 32],
        public_key: &PublicKey,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(96);
        bytes.extend_from_slice(&poll.to_le_bytes());
        bytes.extend_from_slice(&state_index.to_le_bytes());
        bytes.extend_from_slice(&option.to_le_bytes());
        bytes.extend_from_slice(&weight.to_le_bytes());
        bytes.extend_from_slice(&nonce.to_le_bytes());
        bytes.extend_from_slice(salt);
        bytes.extend_from_slice(public_key.as_bytes());
        bytes
    }

    pub fn verify(&self) -> OperatorResult<()> {
        let bytes = Self::canonical_bytes(
            self.poll,
            self.state_index,
            self.option,
            self.weight,
            self.nonce,
            &self.salt,
            &self.public_key,
        );
        verify_signature(&self.public_key, &bytes, &self.signature)
    }
}

/// Voice credits one command consumes under the given mode.
pub fn spend_for_weight(mode: VoteMode, effective: u64) -> u64 {
    match mode {
        VoteMode::Qv => effective.saturating_mul(effective),
        VoteMode::NonQv | VoteMode::Full => effective,
    }
}

/// Largest integer whose square does not exceed `value`.
pub fn integer_sqrt(value: u64) -> u64 {
    if value < 2 {
        return value;
    }
    let mut x = value;
    let mut y = value / 2 + 1;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

fn effective_votes(intent: &VoteIntent, spec: &PollSpec) -> OperatorResult<Vec<WeightedVote>> {
    let option_count = spec.option_count();
    for vote in &intent.votes {
        if vote.option >= option_count {
            return Err(OperatorError::Config(format!(
                "vote targets option {} but the poll has {option_count} options",
                vote.option
            )));
        }
    }
    if spec.mode == VoteMode::Full {
        let mut distinct: Vec<u32> = intent.votes.iter().map(|vote| vote.option).collect();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() > 1 {
            return Err(OperatorError::MultiOptionInFullMode(distinct));
        }
    }
    let transformed = intent.votes.iter().map(|vote| {
        let effective = match spec.mode {
            VoteMode::Qv => integer_sqrt(vote.weight),
            VoteMode::NonQv | VoteMode::Full => vote.weight,
        };
        WeightedVote {
            option: vote.option,
            weight: effective,
        }
    });
    // Zero-effective entries carry no information and must not consume a
    // nonce.
    Ok(transformed.filter(|vote| vote.weight > 0).collect())
}

/// Builds the signed command batch for one voter's ballot.
///
/// Entries are assigned nonces `n, n-1, .., 1` in batch order; the returned
/// list is in nonce-descending order, which callers must preserve through
/// submission.
pub fn build_vote_batch(
    intent: &VoteIntent,
    spec: &PollSpec,
    poll: PollId,
    state_index: StateIndex,
    keypair: &Keypair,
) -> OperatorResult<Vec<VoteCommand>> {
    let effective = effective_votes(intent, spec)?;
    let total = effective.len() as u64;
    let mut commands = Vec::with_capacity(effective.len());
    for (position, vote) in effective.iter().enumerate() {
        let nonce = total - position as u64;
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        let bytes = VoteCommand::canonical_bytes(
            poll,
            state_index,
            vote.option,
            vote.weight,
            nonce,
            &salt,
            &keypair.public,
        );
        let signature = sign_message(keypair, &bytes);
        commands.push(VoteCommand {
            state_index,
            option: vote.option,
            weight: vote.weight,
            nonce,
            poll,
            salt,
            public_key: keypair.public,
            signature,
        });
    }
    Ok(commands)
}

/// Checks the strict descending-by-one nonce order ending at 1 that the
/// wire contract requires of every batch.
pub fn check_nonce_sequence(commands: &[VoteCommand]) -> OperatorResult<()> {
    let total = commands.len() as u64;
    for (position, command) in commands.iter().enumerate() {
        let expected = total - position as u64;
        if command.nonce != expected {
            return Err(OperatorError::NonceSequence(format!(
                "batch of {total} carries nonce {} at position {position}, expected {expected}",
                command.nonce
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::poll::{PollOption, TreeDepths};

    fn sample_spec(mode: VoteMode, option_count: u32) -> PollSpec {
        let keypair = generate_keypair();
        PollSpec {
            name: "sample".into(),
            options: (0..option_count)
                .map(|index| PollOption {
                    label: format!("Option {index}"),
                    info: Vec::new(),
                })
                .collect(),
            start_time: 1_000,
            end_time: 2_000,
            mode,
            tree_depths: TreeDepths::default(),
            coordinator_public_key: hex::encode(keypair.public.to_bytes()),
            relayers: Vec::new(),
        }
    }

    #[test]
    fn integer_sqrt_floors() {
        assert_eq!(integer_sqrt(0), 0);
        assert_eq!(integer_sqrt(1), 1);
        assert_eq!(integer_sqrt(5), 2);
        assert_eq!(integer_sqrt(9), 3);
        assert_eq!(integer_sqrt(10), 3);
        assert_eq!(integer_sqrt(u64::MAX), u32::MAX as u64);
    }

    #[test]
    fn parse_accepts_the_ballot_notation() {
        let intent = VoteIntent::parse("0:5, 1:10").expect("parse");
        assert_eq!(
            intent.votes,
            vec![
                WeightedVote {
                    option: 0,
                    weight: 5
                },
                WeightedVote {
                    option: 1,
                    weight: 10
                },
            ]
        );
    }

    #[test]
    fn parse_rejects_zero_weights_and_garbage() {
        assert!(VoteIntent::parse("0:0").is_err());
        assert!(VoteIntent::parse("0;5").is_err());
        assert!(VoteIntent::parse("a:5").is_err());
    }

    #[test]
    fn qv_weights_are_floored_square_roots() {
        let spec = sample_spec(VoteMode::Qv, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("0:5,1:9").expect("parse");
        let batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].weight, 2);
        assert_eq!(batch[1].weight, 3);
        // Quadratic cost of the whole batch.
        let spend: u64 = batch
            .iter()
            .map(|command| spend_for_weight(VoteMode::Qv, command.weight))
            .sum();
        assert_eq!(spend, 13);
    }

    #[test]
    fn qv_cost_conservation() {
        let spec = sample_spec(VoteMode::Qv, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("0:5,1:3").expect("parse");
        let batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        let spend: u64 = batch
            .iter()
            .map(|command| spend_for_weight(VoteMode::Qv, command.weight))
            .sum();
        assert_eq!(spend, 5);
    }

    #[test]
    fn non_qv_weights_pass_through() {
        let spec = sample_spec(VoteMode::NonQv, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("0:5,2:7").expect("parse");
        let batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        assert_eq!(batch[0].weight, 5);
        assert_eq!(batch[1].weight, 7);
    }

    #[test]
    fn full_mode_rejects_multiple_options() {
        let spec = sample_spec(VoteMode::Full, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("0:4,1:2").expect("parse");
        let err = build_vote_batch(&intent, &spec, 0, 1, &keypair).unwrap_err();
        assert!(matches!(
            err,
            OperatorError::MultiOptionInFullMode(ref options) if options == &vec![0, 1]
        ));
    }

    #[test]
    fn full_mode_accepts_repeated_single_option() {
        let spec = sample_spec(VoteMode::Full, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("2:4,2:2").expect("parse");
        let batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|command| command.option == 2));
    }

    #[test]
    fn nonces_descend_to_one_in_batch_order() {
        let spec = sample_spec(VoteMode::NonQv, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("2:1,0:2,1:3").expect("parse");
        let batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        let nonces: Vec<u64> = batch.iter().map(|command| command.nonce).collect();
        assert_eq!(nonces, vec![3, 2, 1]);
        check_nonce_sequence(&batch).expect("sequence");
    }

    #[test]
    fn zero_effective_entries_do_not_consume_nonces() {
        let spec = sample_spec(VoteMode::Qv, 3);
        let keypair = generate_keypair();
        // floor(sqrt(1)) = 1, so only the weight-1 entries survive; a QV
        // ballot cannot produce an effective zero from a positive weight,
        // but option weights below 1 after transformation must be dropped
        // before nonce assignment.
        let intent = VoteIntent {
            votes: vec![
                WeightedVote {
                    option: 0,
                    weight: 0,
                },
                WeightedVote {
                    option: 1,
                    weight: 4,
                },
            ],
        };
        let batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].option, 1);
        assert_eq!(batch[0].nonce, 1);
    }

    #[test]
    fn out_of_range_option_is_rejected() {
        let spec = sample_spec(VoteMode::NonQv, 2);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("2:1").expect("parse");
        assert!(build_vote_batch(&intent, &spec, 0, 1, &keypair).is_err());
    }

    #[test]
    fn commands_carry_valid_signatures() {
        let spec = sample_spec(VoteMode::NonQv, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("0:5").expect("parse");
        let batch = build_vote_batch(&intent, &spec, 7, 3, &keypair).expect("batch");
        batch[0].verify().expect("signature");
    }

    #[test]
    fn shuffled_batch_fails_the_nonce_check() {
        let spec = sample_spec(VoteMode::NonQv, 3);
        let keypair = generate_keypair();
        let intent = VoteIntent::parse("0:1,1:2,2:3").expect("parse");
        let mut batch = build_vote_batch(&intent, &spec, 0, 1, &keypair).expect("batch");
        batch.swap(0, 2);
        let err = check_nonce_sequence(&batch).unwrap_err();
        assert!(matches!(err, OperatorError::NonceSequence(_)));
    }
}
