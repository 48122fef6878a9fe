//! In-process stand-in for the external voting protocol. Backs `--local`
//! rehearsal runs and the test suite; it enforces the same wire rules the
//! real collaborators would (signed commands, descending nonces, merges
//! before proofs) without any cryptography beyond signature checks.

use std::collections::HashMap;
use std::sync::Arc;

use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Keypair, PublicKey};
use parking_lot::RwLock;

use crate::errors::{OperatorError, OperatorResult};
use crate::interfaces::{
    JoinEvidence, KeyRegistry, PollHandle, PollId, PollLedger, ProofBundle, ProofService,
    StateIndex, TxReceipt, VerifyingKey,
};
use crate::poll::{PollSpec, TreeDepths, VoteMode};
use crate::registrar::{KeyPurpose, VerifyingKeySignature};
use crate::repository::{SpentVoiceCredits, TallyArtifact, TallyResults};
use crate::vote::{check_nonce_sequence, spend_for_weight, VoteCommand};

struct DevnetPoll {
    spec: PollSpec,
    joined: Vec<String>,
    messages: Vec<VoteCommand>,
    signups_merged: bool,
    messages_merged: bool,
    tally: Option<(Vec<u64>, u64)>,
}

#[derive(Default)]
struct DevnetState {
    keys: HashMap<VerifyingKeySignature, VerifyingKey>,
    signups: Vec<String>,
    polls: Vec<DevnetPoll>,
}

/// A complete protocol deployment held in memory. Clones share state, so
/// one instance can serve as registry, ledger, and proof service at once.
#[derive(Clone, Default)]
pub struct DevnetProtocol {
    state: Arc<RwLock<DevnetState>>,
}

impl DevnetProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn compute_tally(poll: &DevnetPoll) -> (Vec<u64>, u64) {
        // Per (voter, option) the last submitted command supersedes earlier
        // ones, mirroring nonce-ordered message processing.
        let mut latest: HashMap<(StateIndex, u32), u64> = HashMap::new();
        for command in &poll.messages {
            latest.insert((command.state_index, command.option), command.weight);
        }
        let mut results = vec![0u64; poll.spec.options.len()];
        let mut spent = 0u64;
        for ((_, option), weight) in latest {
            if let Some(slot) = results.get_mut(option as usize) {
                *slot += weight;
            }
            spent += spend_for_weight(poll.spec.mode, weight);
        }
        if poll.spec.mode == VoteMode::Full {
            // Winner takes all: the whole spend is attributed to the option
            // with the highest raw total, lowest index on a tie.
            let max = results.iter().copied().max().unwrap_or(0);
            let winner = results.iter().position(|&total| total == max).unwrap_or(0);
            results = vec![0u64; poll.spec.options.len()];
            if let Some(slot) = results.get_mut(winner) {
                *slot = spent;
            }
        }
        (results, spent)
    }

    fn receipt(tag: &str, payload: &[u8]) -> TxReceipt {
        let mut hasher = Blake2s256::new();
        hasher.update(tag.as_bytes());
        hasher.update(payload);
        let digest: [u8; 32] = hasher.finalize().into();
        TxReceipt {
            tx_hash: hex::encode(digest),
        }
    }
}

impl KeyRegistry for DevnetProtocol {
    fn get_key(&self, signature: &VerifyingKeySignature) -> OperatorResult<Option<VerifyingKey>> {
        Ok(self.state.read().keys.get(signature).cloned())
    }

    fn set_key(&self, signature: &VerifyingKeySignature, key: &VerifyingKey) -> OperatorResult<()> {
        self.state.write().keys.insert(*signature, key.clone());
        Ok(())
    }
}

impl PollLedger for DevnetProtocol {
    fn create_poll(&self, spec: &PollSpec) -> OperatorResult<PollHandle> {
        let mut state = self.state.write();
        let id = state.polls.len() as PollId;
        state.polls.push(DevnetPoll {
            spec: spec.clone(),
            joined: Vec::new(),
            messages: Vec::new(),
            signups_merged: false,
            messages_merged: false,
            tally: None,
        });
        Ok(PollHandle {
            id,
            poll_address: format!("devnet:poll/{id}"),
            message_processor_address: format!("devnet:mp/{id}"),
            tally_address: format!("devnet:tally/{id}"),
        })
    }

    fn sign_up(&self, public_key: &PublicKey, _policy_evidence: &[u8]) -> OperatorResult<StateIndex> {
        let mut state = self.state.write();
        let encoded = hex::encode(public_key.to_bytes());
        if let Some(position) = state.signups.iter().position(|known| known == &encoded) {
            return Ok(position as StateIndex + 1);
        }
        state.signups.push(encoded);
        Ok(state.signups.len() as StateIndex)
    }

    fn join_poll(&self, poll: PollId, evidence: &JoinEvidence) -> OperatorResult<()> {
        let mut state = self.state.write();
        let poll = state
            .polls
            .get_mut(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        poll.joined.push(hex::encode(&evidence.0));
        Ok(())
    }

    fn submit_vote_batch(
        &self,
        poll: PollId,
        commands: &[VoteCommand],
    ) -> OperatorResult<TxReceipt> {
        check_nonce_sequence(commands)
            .map_err(|err| OperatorError::LedgerUnavailable(format!("batch rejected: {err}")))?;
        for command in commands {
            command.verify().map_err(|err| {
                OperatorError::LedgerUnavailable(format!("batch rejected: {err}"))
            })?;
        }
        let mut state = self.state.write();
        let entry = state
            .polls
            .get_mut(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        entry.messages.extend_from_slice(commands);
        let count = entry.messages.len() as u64;
        Ok(Self::receipt("vote-batch", &count.to_le_bytes()))
    }

    fn merge_signups(&self, poll: PollId) -> OperatorResult<()> {
        let mut state = self.state.write();
        let entry = state
            .polls
            .get_mut(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        entry.signups_merged = true;
        Ok(())
    }

    fn merge_messages(&self, poll: PollId) -> OperatorResult<()> {
        let mut state = self.state.write();
        let entry = state
            .polls
            .get_mut(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        entry.messages_merged = true;
        Ok(())
    }

    fn signups_merged(&self, poll: PollId) -> OperatorResult<bool> {
        let state = self.state.read();
        let entry = state
            .polls
            .get(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        Ok(entry.signups_merged)
    }

    fn messages_merged(&self, poll: PollId) -> OperatorResult<bool> {
        let state = self.state.read();
        let entry = state
            .polls
            .get(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        Ok(entry.messages_merged)
    }

    fn submit_proofs(&self, poll: PollId, bundle: &ProofBundle) -> OperatorResult<TxReceipt> {
        let mut state = self.state.write();
        let entry = state
            .polls
            .get_mut(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        if !entry.signups_merged || !entry.messages_merged {
            return Err(OperatorError::LedgerUnavailable(
                "poll trees are not merged".into(),
            ));
        }
        entry.tally = Some(Self::compute_tally(entry));
        let proofs = bundle.process_proofs.len() + bundle.tally_proofs.len();
        Ok(Self::receipt("submit-proofs", &(proofs as u64).to_le_bytes()))
    }

    fn total_signups(&self) -> OperatorResult<u64> {
        Ok(self.state.read().signups.len() as u64)
    }

    fn is_tallied(&self, poll: PollId) -> OperatorResult<bool> {
        let state = self.state.read();
        let entry = state
            .polls
            .get(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        Ok(entry.tally.is_some())
    }

    fn tally_result(&self, poll: PollId, option: u32) -> OperatorResult<Option<u64>> {
        let state = self.state.read();
        let entry = state
            .polls
            .get(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        Ok(entry
            .tally
            .as_ref()
            .map(|(results, _)| results.get(option as usize).copied().unwrap_or(0)))
    }

    fn total_spent(&self, poll: PollId) -> OperatorResult<Option<u64>> {
        let state = self.state.read();
        let entry = state
            .polls
            .get(poll as usize)
            .ok_or_else(|| OperatorError::LedgerUnavailable(format!("unknown poll {poll}")))?;
        Ok(entry.tally.as_ref().map(|&(_, spent)| spent))
    }
}

impl ProofService for DevnetProtocol {
    fn extract_verifying_key(
        &self,
        depths: &TreeDepths,
        mode: VoteMode,
        purpose: KeyPurpose,
    ) -> OperatorResult<VerifyingKey> {
        let mut hasher = Blake2s256::new();
        hasher.update(b"devnet-vkey");
        hasher.update(purpose.name().as_bytes());
        hasher.update(mode.name().as_bytes());
        hasher.update(depths.state_tree_depth.to_le_bytes());
        hasher.update(depths.tally_processing_state_tree_depth.to_le_bytes());
        hasher.update(depths.vote_option_tree_depth.to_le_bytes());
        hasher.update(depths.message_batch_size.to_le_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        Ok(VerifyingKey {
            bytes: digest.to_vec(),
        })
    }

    fn join_evidence(&self, poll: PollId, public_key: &PublicKey) -> OperatorResult<JoinEvidence> {
        let mut bytes = poll.to_le_bytes().to_vec();
        bytes.extend_from_slice(public_key.as_bytes());
        Ok(JoinEvidence(bytes))
    }

    fn generate_tally(
        &self,
        poll: PollId,
        spec: &PollSpec,
        _coordinator: &Keypair,
    ) -> OperatorResult<(ProofBundle, TallyArtifact)> {
        let state = self.state.read();
        let entry = state
            .polls
            .get(poll as usize)
            .ok_or_else(|| OperatorError::Proof(format!("unknown poll {poll}")))?;
        if !entry.signups_merged || !entry.messages_merged {
            return Err(OperatorError::Proof(
                "poll trees have not been merged yet".into(),
            ));
        }
        let (results, spent) = Self::compute_tally(entry);
        let mut hasher = Blake2s256::new();
        hasher.update(b"devnet-proof");
        hasher.update(poll.to_le_bytes());
        for value in &results {
            hasher.update(value.to_le_bytes());
        }
        let digest: [u8; 32] = hasher.finalize().into();
        let bundle = ProofBundle {
            process_proofs: vec![digest.to_vec()],
            tally_proofs: vec![digest.to_vec()],
        };
        let artifact = TallyArtifact {
            poll_id: poll,
            mode: spec.mode,
            results: TallyResults { tally: results },
            total_spent_voice_credits: SpentVoiceCredits { spent },
        };
        Ok((bundle, artifact))
    }
}

/// Fixed, manually advanced clock for rehearsals and tests.
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: std::sync::atomic::AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

impl crate::orchestrator::Clock for ManualClock {
    fn unix_now(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) fn sample_context() -> (crate::orchestrator::RunContext, tempfile::TempDir) {
    use crate::config::{OperatorConfig, PollConfig, RunConfig, VoterConfig};
    use crate::crypto::generate_keypair;
    use crate::orchestrator::RunContext;
    use crate::repository::{FsAccountStore, FsArtifactRepository};

    let dir = tempfile::tempdir().expect("tempdir");
    let protocol = DevnetProtocol::new();
    let coordinator = generate_keypair();
    let config = OperatorConfig {
        poll: PollConfig {
            name: "Rehearsal".into(),
            options: vec!["Option A".into(), "Option B".into(), "Option C".into()],
            option_info: Vec::new(),
            start_time: 0,
            end_time: 0,
            duration: 150,
            mode: Some(VoteMode::NonQv),
            tree_depths: TreeDepths::default(),
            coordinator_public_key: hex::encode(coordinator.public.to_bytes()),
            relayers: Vec::new(),
        },
        run: RunConfig {
            output_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        },
        voters: ["0:5,1:3", "1:7,2:2", "0:1,2:4", "2:6"]
            .iter()
            .map(|votes| VoterConfig {
                votes: (*votes).to_string(),
            })
            .collect(),
    };
    let ctx = RunContext::new(
        config,
        coordinator,
        Arc::new(protocol.clone()),
        Arc::new(protocol.clone()),
        Arc::new(protocol),
        Arc::new(FsArtifactRepository::new(dir.path())),
        Arc::new(FsAccountStore::new(dir.path())),
        Arc::new(ManualClock::new(1_000)),
    );
    (ctx, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::poll::PollOption;
    use crate::vote::{build_vote_batch, VoteIntent};

    fn sample_spec(mode: VoteMode) -> PollSpec {
        let coordinator = generate_keypair();
        PollSpec {
            name: "devnet".into(),
            options: (0..3)
                .map(|index| PollOption {
                    label: format!("Option {index}"),
                    info: Vec::new(),
                })
                .collect(),
            start_time: 1_000,
            end_time: 2_000,
            mode,
            tree_depths: TreeDepths::default(),
            coordinator_public_key: hex::encode(coordinator.public.to_bytes()),
            relayers: Vec::new(),
        }
    }

    #[test]
    fn signup_assigns_sequential_indices_and_is_idempotent() {
        let devnet = DevnetProtocol::new();
        let first = generate_keypair();
        let second = generate_keypair();
        assert_eq!(devnet.sign_up(&first.public, &[]).expect("signup"), 1);
        assert_eq!(devnet.sign_up(&second.public, &[]).expect("signup"), 2);
        assert_eq!(devnet.sign_up(&first.public, &[]).expect("repeat"), 1);
        assert_eq!(devnet.total_signups().expect("total"), 2);
    }

    #[test]
    fn later_commands_supersede_earlier_ones() {
        let devnet = DevnetProtocol::new();
        let spec = sample_spec(VoteMode::NonQv);
        let handle = devnet.create_poll(&spec).expect("create");
        let voter = generate_keypair();

        let first = build_vote_batch(
            &VoteIntent::parse("0:5").expect("parse"),
            &spec,
            handle.id,
            1,
            &voter,
        )
        .expect("batch");
        let second = build_vote_batch(
            &VoteIntent::parse("0:2").expect("parse"),
            &spec,
            handle.id,
            1,
            &voter,
        )
        .expect("batch");
        devnet.submit_vote_batch(handle.id, &first).expect("submit");
        devnet.submit_vote_batch(handle.id, &second).expect("submit");

        devnet.merge_signups(handle.id).expect("merge");
        devnet.merge_messages(handle.id).expect("merge");
        devnet
            .submit_proofs(
                handle.id,
                &ProofBundle {
                    process_proofs: Vec::new(),
                    tally_proofs: Vec::new(),
                },
            )
            .expect("proofs");
        assert_eq!(devnet.tally_result(handle.id, 0).expect("result"), Some(2));
    }

    #[test]
    fn proofs_require_merged_trees() {
        let devnet = DevnetProtocol::new();
        let spec = sample_spec(VoteMode::NonQv);
        let handle = devnet.create_poll(&spec).expect("create");
        let coordinator = generate_keypair();
        let err = devnet
            .generate_tally(handle.id, &spec, &coordinator)
            .unwrap_err();
        assert!(matches!(err, OperatorError::Proof(_)));
        assert!(!devnet.is_tallied(handle.id).expect("tallied"));
    }

    #[test]
    fn unsigned_batches_are_rejected() {
        let devnet = DevnetProtocol::new();
        let spec = sample_spec(VoteMode::NonQv);
        let handle = devnet.create_poll(&spec).expect("create");
        let voter = generate_keypair();
        let mut batch = build_vote_batch(
            &VoteIntent::parse("0:5").expect("parse"),
            &spec,
            handle.id,
            1,
            &voter,
        )
        .expect("batch");
        batch[0].weight = 50;
        let err = devnet.submit_vote_batch(handle.id, &batch).unwrap_err();
        assert!(matches!(err, OperatorError::LedgerUnavailable(_)));
    }
}
