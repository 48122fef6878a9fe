use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{OperatorError, OperatorResult};
use crate::poll::{PollOption, PollSpec, TreeDepths, VoteMode};

/// Grace window added to "now" when deriving a duration-based start time, so
/// the creation transaction can propagate before the voting period opens.
pub const START_GRACE_SECS: u64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub poll: PollConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub voters: Vec<VoterConfig>,
}

/// Raw poll parameters as written by the operator. Timing may be given
/// either as explicit timestamps or as a duration; [`OperatorConfig::resolve`]
/// turns this into an immutable [`PollSpec`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollConfig {
    pub name: String,
    pub options: Vec<String>,
    /// Hex-encoded opaque metadata blobs, one per option. Passed through
    /// without interpretation; may be empty.
    #[serde(default)]
    pub option_info: Vec<String>,
    #[serde(default)]
    pub start_time: u64,
    #[serde(default)]
    pub end_time: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub mode: Option<VoteMode>,
    #[serde(default)]
    pub tree_depths: TreeDepths,
    pub coordinator_public_key: String,
    #[serde(default)]
    pub relayers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Fixed pause inserted between lifecycle steps, in seconds. Pacing for
    /// rate-limited deployments, not a correctness mechanism.
    #[serde(default)]
    pub step_pause_secs: u64,
    /// Steps with ordinal less than or equal to this value are not executed.
    #[serde(default)]
    pub skip_steps: usize,
    /// Skip steps whose postcondition already holds instead of re-running
    /// them.
    #[serde(default)]
    pub incremental: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./proofs")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            step_pause_secs: 0,
            skip_steps: 0,
            incremental: false,
        }
    }
}

/// One rehearsal voter and the ballot it casts, in `option:weight` pairs,
/// e.g. `"0:5,1:3"`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoterConfig {
    pub votes: String,
}

impl OperatorConfig {
    pub fn load(path: &Path) -> OperatorResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| OperatorError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> OperatorResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| OperatorError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Resolves the raw poll section into an immutable [`PollSpec`].
    ///
    /// Timing rule: when both configured timestamps are zero, a positive
    /// `duration` is required and the window becomes
    /// `[now + START_GRACE_SECS, start + duration]`. When either timestamp is
    /// set, both are taken as given.
    pub fn resolve(&self, now: u64) -> OperatorResult<PollSpec> {
        let poll = &self.poll;
        if poll.options.is_empty() {
            return Err(OperatorError::Config(
                "poll must declare at least one option".into(),
            ));
        }
        for (index, label) in poll.options.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(OperatorError::Config(format!(
                    "option {index} has an empty label"
                )));
            }
        }
        let capacity = poll.tree_depths.vote_option_capacity();
        if poll.options.len() as u64 > capacity {
            return Err(OperatorError::Config(format!(
                "{} options exceed the vote option tree capacity of {capacity}",
                poll.options.len()
            )));
        }
        if !poll.option_info.is_empty() && poll.option_info.len() != poll.options.len() {
            return Err(OperatorError::Config(format!(
                "option_info lists {} entries for {} options",
                poll.option_info.len(),
                poll.options.len()
            )));
        }

        let (start_time, end_time) = if poll.start_time == 0 && poll.end_time == 0 {
            if poll.duration == 0 {
                return Err(OperatorError::Config(
                    "duration must be positive when start_time and end_time are both zero".into(),
                ));
            }
            let start = now + START_GRACE_SECS;
            (start, start + poll.duration)
        } else {
            if poll.start_time == 0 || poll.end_time == 0 {
                return Err(OperatorError::Config(
                    "start_time and end_time must both be set when either is".into(),
                ));
            }
            (poll.start_time, poll.end_time)
        };
        if end_time <= start_time {
            return Err(OperatorError::Config(format!(
                "poll end {end_time} is not after start {start_time}"
            )));
        }

        crate::crypto::public_key_from_hex(&poll.coordinator_public_key)
            .map_err(|err| OperatorError::Config(format!("coordinator public key: {err}")))?;

        let options = poll
            .options
            .iter()
            .enumerate()
            .map(|(index, label)| {
                let info = match poll.option_info.get(index) {
                    Some(encoded) => decode_info_blob(index, encoded)?,
                    None => Vec::new(),
                };
                Ok(PollOption {
                    label: label.clone(),
                    info,
                })
            })
            .collect::<OperatorResult<Vec<_>>>()?;

        let relayers = if poll.relayers.is_empty() {
            vec![ZERO_RELAYER.to_string()]
        } else {
            poll.relayers.clone()
        };

        Ok(PollSpec {
            name: poll.name.clone(),
            options,
            start_time,
            end_time,
            mode: poll.mode.unwrap_or_default(),
            tree_depths: poll.tree_depths,
            coordinator_public_key: poll.coordinator_public_key.clone(),
            relayers,
        })
    }
}

const ZERO_RELAYER: &str = "0x0000000000000000000000000000000000000000";

fn decode_info_blob(index: usize, encoded: &str) -> OperatorResult<Vec<u8>> {
    let stripped = encoded.strip_prefix("0x").unwrap_or(encoded);
    if stripped.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(stripped)
        .map_err(|err| OperatorError::Config(format!("option {index} info is not hex: {err}")))
}
