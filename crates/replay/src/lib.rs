//! Lockstep Replay System
//!
//! This crate records executed turns into a [`ReplayArtifact`] and verifies
//! that re-executing an artifact reproduces the recorded outcome.
//!
//! # Architecture
//!
//! The replay system consists of:
//! - [`ReplayRecorder`]: collects closed turns in execution order
//! - [`verify_replay`]: re-runs an artifact on a fresh authoritative
//!   lockstep and checks it against the recorded anchors
//! - [`write_replay`] / [`read_replay`]: artifact persistence
//!
//! # Verification Anchors
//!
//! - `turn_stream_sha256`: SHA-256 over the turns as command frames; catches
//!   tampering or corruption of the recorded stream itself
//! - `final_turn`: the last executed turn
//! - `stream_digest`: the FNV-1a command-stream digest after `final_turn`
//! - `final_state_digest` (optional): a game-supplied hash of the state after
//!   `final_turn`, checked by [`verify_replay_with_state`]. The stream digest
//!   only covers which commands ran; this one catches command logic that
//!   does not replay deterministically

#![deny(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use lockstep_sim::{
    ClosedTurn, ConfigError, Lockstep, LockstepConfig, LockstepError, LockstepEvent, Role,
    STREAM_DIGEST_ALGO_ID, StepOutcome, StreamDigest, TickContext, Turn,
};
use lockstep_wire::{ReplayArtifact, TurnProto, WireError, frame};
use prost::Message;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Artifact schema version written by this crate.
pub const REPLAY_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("turn {actual} recorded out of order, expected turn {expected}")]
    OutOfOrder { expected: Turn, actual: Turn },

    #[error("unsupported replay format version {0}")]
    UnsupportedVersion(u32),

    #[error("stream digest algorithm mismatch: artifact uses {0}")]
    DigestAlgorithmMismatch(String),

    #[error("artifact carries no session config")]
    MissingConfig,

    #[error("replays run on an authoritative lockstep, got a {0} one")]
    WrongRole(&'static str),

    #[error("turn stream fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    #[error("re-execution stalled before turn {turn}")]
    Stalled { turn: Turn },

    #[error("final turn mismatch: expected {expected}, got {actual}")]
    FinalTurnMismatch { expected: Turn, actual: Turn },

    #[error("stream digest mismatch: expected {expected:#x}, got {actual:#x}")]
    StreamDigestMismatch { expected: u64, actual: u64 },

    #[error("artifact carries no final state digest")]
    MissingStateDigest,

    #[error("final state digest mismatch: expected {expected:#x}, got {actual:#x}")]
    StateDigestMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Lockstep(#[from] LockstepError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to decode replay: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ============================================================================
// Replay Recorder
// ============================================================================

/// Records executed turns for artifact generation.
pub struct ReplayRecorder {
    config: LockstepConfig,
    player_ids: Vec<String>,
    start_turn: Turn,
    last_turn: Turn,
    turns: Vec<TurnProto>,
    fingerprint: Sha256,
    digest: StreamDigest,
}

impl ReplayRecorder {
    /// Start recording a session that begins after `start_turn`.
    pub fn new(config: LockstepConfig, start_turn: Turn, player_ids: Vec<String>) -> Self {
        Self {
            config,
            player_ids,
            start_turn,
            last_turn: start_turn,
            turns: Vec::new(),
            fingerprint: Sha256::new(),
            digest: StreamDigest::new(),
        }
    }

    /// Record the next executed turn. Turns must arrive consecutively.
    pub fn record_turn(&mut self, turn: &ClosedTurn) -> Result<(), ReplayError> {
        let expected = self.last_turn + 1;
        if turn.turn() != expected {
            return Err(ReplayError::OutOfOrder {
                expected,
                actual: turn.turn(),
            });
        }

        let mut framed = Vec::new();
        frame::encode_turn(turn, &mut framed)?;
        self.fingerprint.update(&framed);
        for command in turn.commands() {
            self.digest.record(turn.turn(), command);
        }
        self.turns.push(turn.into());
        self.last_turn = expected;
        Ok(())
    }

    /// Record the turn carried by a [`LockstepEvent::TurnApplied`]; other
    /// events are ignored.
    pub fn record_event(&mut self, event: &LockstepEvent) -> Result<(), ReplayError> {
        match event {
            LockstepEvent::TurnApplied(turn) => self.record_turn(turn),
            _ => Ok(()),
        }
    }

    pub fn final_turn(&self) -> Turn {
        self.last_turn
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Produce the artifact, anchored on the final state as hashed by the
    /// game.
    pub fn finalize_with_state_digest(self, state_digest: u64) -> ReplayArtifact {
        ReplayArtifact {
            final_state_digest: Some(state_digest),
            ..self.finalize()
        }
    }

    /// Produce the artifact.
    pub fn finalize(self) -> ReplayArtifact {
        let turn_stream_sha256 = format!("{:x}", self.fingerprint.finalize());
        debug!(turns = self.turns.len(), final_turn = self.last_turn, "replay finalized");

        ReplayArtifact {
            replay_format_version: REPLAY_FORMAT_VERSION,
            config: Some((&self.config).into()),
            start_turn: self.start_turn,
            final_turn: self.last_turn,
            turns: self.turns,
            stream_digest_algo_id: STREAM_DIGEST_ALGO_ID.to_string(),
            stream_digest: self.digest.value(),
            turn_stream_sha256,
            player_ids: self.player_ids,
            final_state_digest: None,
        }
    }
}

/// SHA-256 (lowercase hex) of `turns` framed back to back.
pub fn turn_stream_sha256<'a>(
    turns: impl IntoIterator<Item = &'a ClosedTurn>,
) -> Result<String, WireError> {
    let mut hasher = Sha256::new();
    let mut framed = Vec::new();
    for turn in turns {
        framed.clear();
        frame::encode_turn(turn, &mut framed)?;
        hasher.update(&framed);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Replay Verification
// ============================================================================

/// Summary of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub turns: u64,
    pub commands: u64,
    /// Commands that failed during re-execution, as they did when recorded.
    pub failed_commands: u64,
}

/// Verify a replay artifact produces the recorded outcome.
///
/// `lockstep` must be a stopped authoritative lockstep carrying the same
/// command logic as the recorded session. Its config is replaced by the
/// artifact's.
///
/// # Verification Steps
/// 1. Check format version and digest algorithm
/// 2. Decode turns and check they are consecutive from `start_turn`
/// 3. Recompute the turn stream fingerprint
/// 4. Re-execute every turn
/// 5. Assert the final turn and stream digest
pub fn verify_replay<S>(
    artifact: &ReplayArtifact,
    lockstep: &mut Lockstep<S>,
) -> Result<ReplayReport, ReplayError> {
    replay(artifact, lockstep, None::<fn(&S) -> u64>)
}

/// [`verify_replay`], then also hash the re-executed state with
/// `state_digest` and compare it to the artifact's `final_state_digest`.
pub fn verify_replay_with_state<S, F>(
    artifact: &ReplayArtifact,
    lockstep: &mut Lockstep<S>,
    state_digest: F,
) -> Result<ReplayReport, ReplayError>
where
    F: Fn(&S) -> u64,
{
    if artifact.final_state_digest.is_none() {
        return Err(ReplayError::MissingStateDigest);
    }
    replay(artifact, lockstep, Some(state_digest))
}

fn replay<S, F>(
    artifact: &ReplayArtifact,
    lockstep: &mut Lockstep<S>,
    state_digest: Option<F>,
) -> Result<ReplayReport, ReplayError>
where
    F: Fn(&S) -> u64,
{
    // Step 1: Format
    if artifact.replay_format_version != REPLAY_FORMAT_VERSION {
        return Err(ReplayError::UnsupportedVersion(
            artifact.replay_format_version,
        ));
    }
    if artifact.stream_digest_algo_id != STREAM_DIGEST_ALGO_ID {
        return Err(ReplayError::DigestAlgorithmMismatch(
            artifact.stream_digest_algo_id.clone(),
        ));
    }
    if lockstep.role() != Role::Authority {
        return Err(ReplayError::WrongRole(lockstep.role().as_str()));
    }
    let config: LockstepConfig = artifact
        .config
        .clone()
        .ok_or(ReplayError::MissingConfig)?
        .try_into()?;

    // Step 2: Turn stream
    let mut turns = Vec::with_capacity(artifact.turns.len());
    let mut expected = artifact.start_turn + 1;
    for proto in &artifact.turns {
        let turn = ClosedTurn::try_from(proto.clone())?;
        if turn.turn() != expected {
            return Err(ReplayError::OutOfOrder {
                expected,
                actual: turn.turn(),
            });
        }
        expected += 1;
        turns.push(turn);
    }

    // Step 3: Fingerprint
    let actual = turn_stream_sha256(&turns)?;
    if actual != artifact.turn_stream_sha256 {
        return Err(ReplayError::FingerprintMismatch {
            expected: artifact.turn_stream_sha256.clone(),
            actual,
        });
    }

    // Step 4: Re-execute
    let factor = u64::from(config.command_step_factor);
    lockstep.set_config(config)?;
    lockstep.start(artifact.start_turn);
    for turn in turns {
        lockstep.confirm_turn(turn);
    }
    let ticks = (artifact.final_turn.saturating_sub(artifact.start_turn)) * factor;
    let before = lockstep.stats();
    for step in 1..=ticks {
        if lockstep.step_simulation(&TickContext::manual(step)) == StepOutcome::Blocked {
            lockstep.stop();
            return Err(ReplayError::Stalled {
                turn: lockstep.current_turn() + 1,
            });
        }
    }
    lockstep.stop();
    let after = lockstep.stats();

    // Step 5: Anchors
    if lockstep.current_turn() != artifact.final_turn {
        return Err(ReplayError::FinalTurnMismatch {
            expected: artifact.final_turn,
            actual: lockstep.current_turn(),
        });
    }
    let digest = lockstep.digest().value();
    if digest != artifact.stream_digest {
        return Err(ReplayError::StreamDigestMismatch {
            expected: artifact.stream_digest,
            actual: digest,
        });
    }
    if let (Some(hash), Some(expected)) = (state_digest, artifact.final_state_digest) {
        let actual = hash(lockstep.state());
        if actual != expected {
            return Err(ReplayError::StateDigestMismatch { expected, actual });
        }
    }

    let report = ReplayReport {
        turns: after.executed_turns - before.executed_turns,
        commands: after.executed_commands - before.executed_commands,
        failed_commands: after.failed_commands - before.failed_commands,
    };
    info!(turns = report.turns, commands = report.commands, "replay verified");
    Ok(report)
}

// ============================================================================
// Replay I/O
// ============================================================================

/// Write a replay artifact to a file. Refuses to overwrite.
pub fn write_replay(artifact: &ReplayArtifact, path: &Path) -> Result<(), ReplayError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("replay artifact already exists at {}", path.display()),
        )
        .into());
    }

    let mut file = fs::File::create(path)?;
    file.write_all(&artifact.encode_to_vec())?;
    Ok(())
}

pub fn read_replay(path: &Path) -> Result<ReplayArtifact, ReplayError> {
    let data = fs::read(path)?;
    Ok(ReplayArtifact::decode(data.as_slice())?)
}

// ============================================================================
// Tests
// ============================================================================
