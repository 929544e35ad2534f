//! Commands, submissions and closed turns.
//!
//! A [`Command`] is the unit of player intent: a registered type id, the
//! issuing player and an opaque payload produced by the type's
//! [`CommandPayload`] codec. Commands travel inside a [`Submission`] (one
//! player's entry for one turn) and come back inside a [`ClosedTurn`] once
//! the server has frozen that turn.

use std::collections::BTreeMap;

use crate::error::{CommandError, PayloadError, TurnError};
use crate::{CommandSeq, CommandTypeId, PlayerNumber, Turn};

// ============================================================================
// Payload Codec
// ============================================================================

/// Typed command payload with its own byte codec.
///
/// Implementors pick a stable `TYPE_ID`; the id is what travels on the wire
/// and what the registry dispatches on.
pub trait CommandPayload: Sized + 'static {
    const TYPE_ID: CommandTypeId;

    /// Human readable name used in logs.
    const NAME: &'static str;

    fn encode_payload(&self) -> Vec<u8>;

    fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadError>;
}

// ============================================================================
// Command
// ============================================================================

/// One player's command, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub type_id: CommandTypeId,
    pub player: PlayerNumber,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(type_id: CommandTypeId, player: PlayerNumber, payload: Vec<u8>) -> Self {
        Self {
            type_id,
            player,
            payload,
        }
    }

    /// Encode a typed payload into a command issued by `player`.
    pub fn from_payload<C: CommandPayload>(player: PlayerNumber, payload: &C) -> Self {
        Self::new(C::TYPE_ID, player, payload.encode_payload())
    }

    /// Decode the payload as `C`, checking the type id first.
    pub fn decode<C: CommandPayload>(&self) -> Result<C, CommandError> {
        if self.type_id != C::TYPE_ID {
            return Err(CommandError::TypeMismatch {
                expected: C::TYPE_ID,
                actual: self.type_id,
            });
        }
        C::decode_payload(&self.payload).map_err(|source| CommandError::Payload {
            type_id: self.type_id,
            source,
        })
    }

    /// Same command re-attributed to `player`.
    pub fn with_player(mut self, player: PlayerNumber) -> Self {
        self.player = player;
        self
    }
}

// ============================================================================
// Submission
// ============================================================================

/// A player's entry for one turn.
///
/// A submission without a command is a heartbeat: it tells the server the
/// player has nothing to do this turn so the turn need not wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub turn: Turn,
    /// Per-sender sequence number; zero for heartbeats.
    pub seq: CommandSeq,
    pub command: Option<Command>,
}

impl Submission {
    pub fn heartbeat(turn: Turn) -> Self {
        Self {
            turn,
            seq: 0,
            command: None,
        }
    }

    pub fn command(turn: Turn, seq: CommandSeq, command: Command) -> Self {
        Self {
            turn,
            seq,
            command: Some(command),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command.is_none()
    }
}

/// Why a submission was refused by the anticipation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// The target turn is already closed.
    TooLate,
    /// The target turn is beyond the acceptance horizon.
    TooEarly,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooLate => "too_late",
            Self::TooEarly => "too_early",
        }
    }
}

// ============================================================================
// Closed Turn
// ============================================================================

/// A frozen turn: at most one command per player, in ascending player order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedTurn {
    turn: Turn,
    commands: Vec<Command>,
}

impl ClosedTurn {
    pub fn empty(turn: Turn) -> Self {
        Self {
            turn,
            commands: Vec::new(),
        }
    }

    /// Build a closed turn from commands in any order.
    ///
    /// Commands are sorted into canonical order; two commands from the same
    /// player are rejected.
    pub fn new(turn: Turn, mut commands: Vec<Command>) -> Result<Self, TurnError> {
        commands.sort_by_key(|c| c.player);
        if let Some(pair) = commands.windows(2).find(|w| w[0].player == w[1].player) {
            return Err(TurnError::DuplicatePlayer {
                turn,
                player: pair[0].player,
            });
        }
        Ok(Self { turn, commands })
    }

    /// Build from a per-player map; map order is already canonical.
    pub fn from_slots(turn: Turn, slots: BTreeMap<PlayerNumber, Command>) -> Self {
        Self {
            turn,
            commands: slots.into_values().collect(),
        }
    }

    pub fn turn(&self) -> Turn {
        self.turn
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// The command `player` contributed to this turn, if any.
    pub fn command_of(&self, player: PlayerNumber) -> Option<&Command> {
        self.commands
            .binary_search_by_key(&player, |c| c.player)
            .ok()
            .map(|index| &self.commands[index])
    }
}

// ============================================================================
// Tests
// ============================================================================
