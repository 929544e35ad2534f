//! Lockstep Simulation Core
//!
//! This crate contains the deterministic half of the lockstep engine: the
//! part every node (server and clients alike) runs identically. It owns:
//! - Session configuration ([`LockstepConfig`])
//! - The periodic clock ([`Scheduler`])
//! - The command model and typed registry ([`Command`], [`CommandRegistry`])
//! - Turn execution behind the public facade ([`Lockstep`])
//! - The command-stream digest used to compare replicas ([`StreamDigest`])
//!
//! # Determinism Constraints
//!
//! Nothing here performs I/O or reads the wall clock. Time only enters
//! through the deltas handed to [`Scheduler::tick`], and liveness depends on
//! tick counts, never on real time:
//! - turns execute in increasing order with no gaps
//! - commands inside a turn apply in ascending player number order
//! - every closed turn is executed exactly once per node

#![deny(unsafe_code)]

pub mod anticipation;
pub mod command;
pub mod config;
pub mod error;
pub mod lockstep;
pub mod registry;
pub mod scheduler;

pub use anticipation::AnticipationTuner;
pub use command::{ClosedTurn, Command, CommandPayload, Rejection, Submission};
pub use config::LockstepConfig;
pub use error::{
    CommandError, ConfigError, LockstepError, PayloadError, SubmitError, TurnError,
};
pub use lockstep::{Lockstep, LockstepEvent, LockstepStats, Role, Submitted};
pub use registry::{CommandFactory, CommandRegistry};
pub use scheduler::{ListenerFault, Scheduler, StepOutcome, TickContext, TickReport};

// ============================================================================
// Type Aliases
// ============================================================================

/// A command turn number. Turns are numbered from 1; turn 0 is "before the
/// first turn".
pub type Turn = u64;

/// A simulation step index. Turn `T` executes on tick `T * CommandStepFactor`.
pub type SimTick = u64;

/// Stable per-session participant identity, assigned in join order.
pub type PlayerNumber = u8;

/// Registered command type identifier.
pub type CommandTypeId = u32;

/// Per-sender submission sequence number. Zero is reserved for heartbeats.
pub type CommandSeq = u32;

// ============================================================================
// Command Stream Digest
// ============================================================================

/// Command-stream digest algorithm identifier.
pub const STREAM_DIGEST_ALGO_ID: &str = "lockstep-stream-v2-fnv1a64-le-turn-player-type-len64-payload";

/// FNV-1a 64-bit offset basis.
const FNV1A_OFFSET_BASIS: u64 = 0xcbf29ce484222325;

/// FNV-1a 64-bit prime.
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Running FNV-1a digest over every executed command.
///
/// Two nodes that executed the same commands in the same turns and order
/// hold the same digest, so replicas can be compared with a single `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDigest {
    state: u64,
}

impl Default for StreamDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDigest {
    pub fn new() -> Self {
        Self {
            state: FNV1A_OFFSET_BASIS,
        }
    }

    /// Fold one executed command into the digest.
    ///
    /// Layout: turn (u64 LE), player (u8), type id (u32 LE), payload length
    /// (u64 LE), payload bytes.
    pub fn record(&mut self, turn: Turn, command: &Command) {
        self.update(&turn.to_le_bytes());
        self.update(&[command.player]);
        self.update(&command.type_id.to_le_bytes());
        self.update(&(command.payload.len() as u64).to_le_bytes());
        self.update(&command.payload);
    }

    pub fn value(&self) -> u64 {
        self.state
    }

    fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV1A_PRIME);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
