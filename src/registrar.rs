use std::fmt;

use blake2::{Blake2s256, Digest};

use crate::errors::OperatorResult;
use crate::interfaces::{KeyRegistry, VerifyingKey};
use crate::poll::{TreeDepths, VoteMode};

const SIGNATURE_DOMAIN: &[u8] = b"privote-operator:vkey:v1";

/// Deterministic digest identifying one verifying-key configuration.
/// Identical depth parameters, mode, and purpose always produce the same
/// signature, which is what makes registration idempotent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VerifyingKeySignature([u8; 32]);

impl VerifyingKeySignature {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for VerifyingKeySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Which circuit a verifying key belongs to. Process and tally keys for the
/// same depth configuration register under distinct signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPurpose {
    MessageProcessing,
    VoteTallying,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 2] = [KeyPurpose::MessageProcessing, KeyPurpose::VoteTallying];

    pub fn name(&self) -> &'static str {
        match self {
            KeyPurpose::MessageProcessing => "message-processing",
            KeyPurpose::VoteTallying => "vote-tallying",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            KeyPurpose::MessageProcessing => 0,
            KeyPurpose::VoteTallying => 1,
        }
    }
}

/// Computes the registry signature for one verifying-key configuration.
pub fn key_signature(
    depths: &TreeDepths,
    mode: VoteMode,
    purpose: KeyPurpose,
) -> VerifyingKeySignature {
    let mut hasher = Blake2s256::new();
    hasher.update(SIGNATURE_DOMAIN);
    hasher.update([purpose.tag(), mode.tag()]);
    hasher.update(depths.state_tree_depth.to_le_bytes());
    hasher.update(depths.tally_processing_state_tree_depth.to_le_bytes());
    hasher.update(depths.vote_option_tree_depth.to_le_bytes());
    hasher.update(depths.message_batch_size.to_le_bytes());
    VerifyingKeySignature(hasher.finalize().into())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// A registration write was issued.
    Registered,
    /// The stored key already matched the candidate; no write happened.
    Skipped,
}

/// Registers `candidate` under its configuration signature unless an equal
/// key is already stored. Registration writes are expensive and rate
/// limited, so the stored key is compared by value first; a failing read
/// propagates instead of being treated as absence.
pub fn ensure_registered(
    registry: &dyn KeyRegistry,
    depths: &TreeDepths,
    mode: VoteMode,
    purpose: KeyPurpose,
    candidate: &VerifyingKey,
) -> OperatorResult<Registration> {
    let signature = key_signature(depths, mode, purpose);
    match registry.get_key(&signature)? {
        Some(stored) if stored == *candidate => Ok(Registration::Skipped),
        _ => {
            registry.set_key(&signature, candidate)?;
            Ok(Registration::Registered)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use super::*;
    use crate::errors::OperatorError;

    #[derive(Default)]
    struct RecordingRegistry {
        keys: RwLock<HashMap<VerifyingKeySignature, VerifyingKey>>,
        writes: AtomicUsize,
        fail_reads: bool,
    }

    impl KeyRegistry for RecordingRegistry {
        fn get_key(
            &self,
            signature: &VerifyingKeySignature,
        ) -> OperatorResult<Option<VerifyingKey>> {
            if self.fail_reads {
                return Err(OperatorError::RegistryUnavailable("read timed out".into()));
            }
            Ok(self.keys.read().get(signature).cloned())
        }

        fn set_key(
            &self,
            signature: &VerifyingKeySignature,
            key: &VerifyingKey,
        ) -> OperatorResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.keys.write().insert(*signature, key.clone());
            Ok(())
        }
    }

    fn sample_key(byte: u8) -> VerifyingKey {
        VerifyingKey {
            bytes: vec![byte; 64],
        }
    }

    #[test]
    fn identical_configurations_share_a_signature() {
        let depths = TreeDepths::default();
        let first = key_signature(&depths, VoteMode::Qv, KeyPurpose::MessageProcessing);
        let second = key_signature(&depths, VoteMode::Qv, KeyPurpose::MessageProcessing);
        assert_eq!(first, second);
    }

    #[test]
    fn signatures_distinguish_mode_and_purpose() {
        let depths = TreeDepths::default();
        let process_qv = key_signature(&depths, VoteMode::Qv, KeyPurpose::MessageProcessing);
        let tally_qv = key_signature(&depths, VoteMode::Qv, KeyPurpose::VoteTallying);
        let process_non_qv = key_signature(&depths, VoteMode::NonQv, KeyPurpose::MessageProcessing);
        assert_ne!(process_qv, tally_qv);
        assert_ne!(process_qv, process_non_qv);
    }

    #[test]
    fn repeated_registration_writes_once() {
        let registry = RecordingRegistry::default();
        let depths = TreeDepths::default();
        let key = sample_key(7);

        let first = ensure_registered(
            &registry,
            &depths,
            VoteMode::Qv,
            KeyPurpose::MessageProcessing,
            &key,
        )
        .expect("first registration");
        let second = ensure_registered(
            &registry,
            &depths,
            VoteMode::Qv,
            KeyPurpose::MessageProcessing,
            &key,
        )
        .expect("second registration");

        assert_eq!(first, Registration::Registered);
        assert_eq!(second, Registration::Skipped);
        assert_eq!(registry.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_candidate_triggers_rewrite() {
        let registry = RecordingRegistry::default();
        let depths = TreeDepths::default();
        ensure_registered(
            &registry,
            &depths,
            VoteMode::NonQv,
            KeyPurpose::VoteTallying,
            &sample_key(1),
        )
        .expect("initial registration");
        let outcome = ensure_registered(
            &registry,
            &depths,
            VoteMode::NonQv,
            KeyPurpose::VoteTallying,
            &sample_key(2),
        )
        .expect("rotation");
        assert_eq!(outcome, Registration::Registered);
        assert_eq!(registry.writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_read_is_not_treated_as_absence() {
        let registry = RecordingRegistry {
            fail_reads: true,
            ..RecordingRegistry::default()
        };
        let err = ensure_registered(
            &registry,
            &TreeDepths::default(),
            VoteMode::Qv,
            KeyPurpose::MessageProcessing,
            &sample_key(3),
        )
        .unwrap_err();
        assert!(matches!(err, OperatorError::RegistryUnavailable(_)));
        assert_eq!(registry.writes.load(Ordering::SeqCst), 0);
    }
}
