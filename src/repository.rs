use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::errors::OperatorResult;
use crate::interfaces::{PollId, StateIndex};
use crate::poll::VoteMode;

/// Persisted tally proof artifact, the file-sourced counterpart to the
/// on-chain result. Field names follow the wire layout consumed by result
/// viewers (`results.tally`, `totalSpentVoiceCredits.spent`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyArtifact {
    pub poll_id: PollId,
    pub mode: VoteMode,
    pub results: TallyResults,
    pub total_spent_voice_credits: SpentVoiceCredits,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyResults {
    pub tally: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentVoiceCredits {
    pub spent: u64,
}

/// Storage for the tally artifact. Core logic never touches filesystem
/// paths; any backend implementing this trait will do.
pub trait ArtifactRepository: Send + Sync {
    /// Returns the stored artifact, or `None` when no artifact exists yet.
    fn load_tally(&self) -> OperatorResult<Option<TallyArtifact>>;

    fn save_tally(&self, artifact: &TallyArtifact) -> OperatorResult<()>;
}

/// One rehearsal voter's key material and progress markers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoterRecord {
    pub account: u32,
    pub public_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub state_index: Option<StateIndex>,
    #[serde(default)]
    pub voted: bool,
}

impl VoterRecord {
    pub fn from_keypair(account: u32, keypair: &Keypair) -> Self {
        Self {
            account,
            public_key: hex::encode(keypair.public.to_bytes()),
            secret_key: hex::encode(keypair.secret.to_bytes()),
            state_index: None,
            voted: false,
        }
    }

    pub fn to_keypair(&self) -> OperatorResult<Keypair> {
        crypto::keypair_from_hex(&self.secret_key, &self.public_key)
    }
}

/// Storage for voter account records.
pub trait AccountStore: Send + Sync {
    /// Returns all known records; an empty store yields an empty list.
    fn load(&self) -> OperatorResult<Vec<VoterRecord>>;

    fn save(&self, records: &[VoterRecord]) -> OperatorResult<()>;
}

pub struct FsArtifactRepository {
    path: PathBuf,
}

impl FsArtifactRepository {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("tally.json"),
        }
    }
}

impl ArtifactRepository for FsArtifactRepository {
    fn load_tally(&self) -> OperatorResult<Option<TallyArtifact>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save_tally(&self, artifact: &TallyArtifact) -> OperatorResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string_pretty(artifact)?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }
}

pub struct FsAccountStore {
    path: PathBuf,
}

impl FsAccountStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join("accounts.json"),
        }
    }
}

impl AccountStore for FsAccountStore {
    fn load(&self) -> OperatorResult<Vec<VoterRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, records: &[VoterRecord]) -> OperatorResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string_pretty(records)?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }
}
