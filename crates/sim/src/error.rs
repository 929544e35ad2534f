//! Error types for the lockstep core.

use thiserror::Error;

use crate::{CommandTypeId, PlayerNumber, Turn};

/// Invalid session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error(
        "anticipation bounds out of order: expected {min} <= {execution} <= {max}"
    )]
    AnticipationOrder { min: u32, execution: u32, max: u32 },
}

/// A command payload could not be materialized from its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Failure while dispatching a single command.
///
/// A failed command never aborts its turn; the remaining commands still run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command type {type_id} is not registered")]
    Unregistered { type_id: CommandTypeId },

    #[error("expected command type {expected}, got {actual}")]
    TypeMismatch {
        expected: CommandTypeId,
        actual: CommandTypeId,
    },

    #[error("malformed payload for command type {type_id}: {source}")]
    Payload {
        type_id: CommandTypeId,
        #[source]
        source: PayloadError,
    },

    #[error("command rejected by logic: {0}")]
    Rejected(String),
}

impl CommandError {
    /// Shorthand for handler-side failures.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// A closed turn violates the one-command-per-player rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("turn {turn} carries more than one command for player {player}")]
    DuplicatePlayer { turn: Turn, player: PlayerNumber },
}

/// A local command could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("this lockstep has no local player number")]
    NoPlayerNumber,

    #[error("command type {0} is not registered")]
    Unregistered(CommandTypeId),
}

/// Misuse of the lockstep lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockstepError {
    #[error("the lockstep is running; configuration is frozen")]
    AlreadyRunning,

    #[error("player number is already set to {0}")]
    PlayerNumberFixed(PlayerNumber),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
