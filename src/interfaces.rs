use ed25519_dalek::{Keypair, PublicKey};

use crate::errors::OperatorResult;
use crate::poll::{PollSpec, TreeDepths, VoteMode};
use crate::registrar::{KeyPurpose, VerifyingKeySignature};
use crate::repository::TallyArtifact;
use crate::vote::VoteCommand;

/// Identifier of one poll instance on the ledger.
pub type PollId = u64;

/// Position of a signed-up voter in the protocol's state tree. Assigned
/// sequentially by the ledger; order-sensitive.
pub type StateIndex = u64;

/// Opaque verifying-key material for one circuit configuration. Compared by
/// value when deciding whether a registration write is needed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    pub bytes: Vec<u8>,
}

/// Addresses of the contract set backing one deployed poll.
#[derive(Clone, Debug)]
pub struct PollHandle {
    pub id: PollId,
    pub poll_address: String,
    pub message_processor_address: String,
    pub tally_address: String,
}

#[derive(Clone, Debug)]
pub struct TxReceipt {
    pub tx_hash: String,
}

/// Opaque proof material authorising a voter to join a poll.
#[derive(Clone, Debug)]
pub struct JoinEvidence(pub Vec<u8>);

/// Opaque message-processing and tally proofs produced by the proof service
/// and submitted on-chain unchanged.
#[derive(Clone, Debug)]
pub struct ProofBundle {
    pub process_proofs: Vec<Vec<u8>>,
    pub tally_proofs: Vec<Vec<u8>>,
}

/// External registry holding verifying keys, keyed by deterministic
/// configuration signatures.
///
/// Implementations must surface read failures as
/// [`crate::errors::OperatorError::RegistryUnavailable`]; a failed read is
/// never reported as an absent key.
pub trait KeyRegistry: Send + Sync {
    /// Returns the key currently registered under `signature`, if any.
    fn get_key(&self, signature: &VerifyingKeySignature) -> OperatorResult<Option<VerifyingKey>>;

    /// Registers `key` under `signature`, overwriting any previous value.
    fn set_key(&self, signature: &VerifyingKeySignature, key: &VerifyingKey) -> OperatorResult<()>;
}

/// The on-chain protocol surface the operator drives. Every call is a
/// blocking I/O boundary; failures map to
/// [`crate::errors::OperatorError::LedgerUnavailable`].
pub trait PollLedger: Send + Sync {
    /// Deploys a poll from the resolved spec and returns its contract set.
    fn create_poll(&self, spec: &PollSpec) -> OperatorResult<PollHandle>;

    /// Registers a voter key, returning its sequentially assigned state
    /// index.
    fn sign_up(&self, public_key: &PublicKey, policy_evidence: &[u8]) -> OperatorResult<StateIndex>;

    /// Admits a signed-up voter into a specific poll.
    fn join_poll(&self, poll: PollId, evidence: &JoinEvidence) -> OperatorResult<()>;

    /// Publishes one voter's command batch. Submission order must equal
    /// nonce-descending order within the batch.
    fn submit_vote_batch(&self, poll: PollId, commands: &[VoteCommand])
        -> OperatorResult<TxReceipt>;

    /// Finalises the signup tree ahead of proof generation.
    fn merge_signups(&self, poll: PollId) -> OperatorResult<()>;

    /// Finalises the message tree ahead of proof generation.
    fn merge_messages(&self, poll: PollId) -> OperatorResult<()>;

    fn signups_merged(&self, poll: PollId) -> OperatorResult<bool>;

    fn messages_merged(&self, poll: PollId) -> OperatorResult<bool>;

    /// Submits the generated proofs, after which the ledger exposes tally
    /// results.
    fn submit_proofs(&self, poll: PollId, bundle: &ProofBundle) -> OperatorResult<TxReceipt>;

    /// Number of voters registered across all polls.
    fn total_signups(&self) -> OperatorResult<u64>;

    fn is_tallied(&self, poll: PollId) -> OperatorResult<bool>;

    /// Published tally for one option, or `None` while the result is unset.
    fn tally_result(&self, poll: PollId, option: u32) -> OperatorResult<Option<u64>>;

    /// Published total of spent voice credits, or `None` while unset.
    fn total_spent(&self, poll: PollId) -> OperatorResult<Option<u64>>;
}

/// Zero-knowledge proof generation backend. Treated as a black box; the
/// operator only moves its outputs around.
pub trait ProofService: Send + Sync {
    /// Extracts the verifying key for one circuit configuration.
    fn extract_verifying_key(
        &self,
        depths: &TreeDepths,
        mode: VoteMode,
        purpose: KeyPurpose,
    ) -> OperatorResult<VerifyingKey>;

    /// Produces the joining evidence for one voter and poll.
    fn join_evidence(&self, poll: PollId, public_key: &PublicKey) -> OperatorResult<JoinEvidence>;

    /// Generates message-processing and tally proofs for a merged poll,
    /// together with the tally artifact to persist.
    fn generate_tally(
        &self,
        poll: PollId,
        spec: &PollSpec,
        coordinator: &Keypair,
    ) -> OperatorResult<(ProofBundle, TallyArtifact)>;
}
