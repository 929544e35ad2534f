//! Lockstep Wire Protocol Types
//!
//! This crate defines the Protobuf messages exchanged between the lockstep
//! server and its clients, plus the conversions to and from the core types
//! of `lockstep-sim`. Server and client MUST both depend on this crate so
//! they agree on one schema.
//!
//! # Message Categories
//!
//! - **Session**: `ClientSetup`, `PlayerReady`, `ClientStart`,
//!   `ParticipantStatus`, `ServerError`
//! - **Turns**: `SubmitCommand` (client → server), `CommandRejected`,
//!   `Turn`, `EmptyTurns`, `TurnAck`
//! - **Replay**: [`ReplayArtifact`]
//!
//! Every message travels as `(msg_type, encoded bytes)`; see [`msg_type`].
//! Commands themselves use the [`CommandProto`] layout
//! `{ type_id, player_number, payload }`, whose length-delimited `payload`
//! field carries the payload length. [`frame`] offers the same layout as a
//! fixed binary frame for byte-level hashing and storage.

#![deny(unsafe_code)]

pub mod frame;
pub mod transport;

use lockstep_sim::{
    ClosedTurn, Command, ConfigError, LockstepConfig, PlayerNumber, Rejection, Submission,
    TurnError,
};
use prost::Message;
use thiserror::Error;

pub use lockstep_sim::{CommandSeq, CommandTypeId, Turn};

// ============================================================================
// Message Type Codes
// ============================================================================

/// Message type codes carried next to each encoded message.
pub mod msg_type {
    pub const SUBMIT_COMMAND: u8 = 2;
    pub const TURN: u8 = 3;
    pub const EMPTY_TURNS: u8 = 4;
    pub const CLIENT_SETUP: u8 = 5;
    pub const PLAYER_READY: u8 = 6;
    pub const CLIENT_START: u8 = 7;
    pub const PARTICIPANT_STATUS: u8 = 10;
    pub const TURN_ACK: u8 = 11;
    pub const COMMAND_REJECTED: u8 = 12;
    pub const SERVER_ERROR: u8 = 13;

    /// Name of a message type, for logs.
    pub fn name(code: u8) -> Option<&'static str> {
        Some(match code {
            SUBMIT_COMMAND => "SubmitCommand",
            TURN => "Turn",
            EMPTY_TURNS => "EmptyTurns",
            CLIENT_SETUP => "ClientSetup",
            PLAYER_READY => "PlayerReady",
            CLIENT_START => "ClientStart",
            PARTICIPANT_STATUS => "ParticipantStatus",
            TURN_ACK => "TurnAck",
            COMMAND_REJECTED => "CommandRejected",
            SERVER_ERROR => "ServerError",
            _ => return None,
        })
    }
}

/// `ServerError` codes.
pub mod error_code {
    /// A command failed on the authoritative execution path.
    pub const COMMAND_FAILED: u32 = 300;
    /// All player slots are taken.
    pub const MATCH_FULL: u32 = 301;
    /// A message could not be decoded and was dropped.
    pub const MALFORMED_MESSAGE: u32 = 302;
    /// Another connection already plays under the same player id.
    pub const PLAYER_ID_IN_USE: u32 = 303;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode {message}: {source}")]
    Decode {
        message: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("{field} value {value} is out of range")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("unknown rejection reason {0}")]
    UnknownRejectionReason(i32),

    #[error(transparent)]
    Turn(#[from] TurnError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Decode a message, naming its type in the error.
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, WireError> {
    M::decode(bytes).map_err(|source| WireError::Decode {
        message: short_type_name::<M>(),
        source,
    })
}

fn short_type_name<M>() -> &'static str {
    let full = std::any::type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}

fn player_number(field: &'static str, value: u32) -> Result<PlayerNumber, WireError> {
    PlayerNumber::try_from(value).map_err(|_| WireError::OutOfRange {
        field,
        value: u64::from(value),
    })
}

// ============================================================================
// Turn Messages
// ============================================================================

/// One command. `player_number` is u32 on the wire for protobuf.
#[derive(Clone, PartialEq, Message)]
pub struct CommandProto {
    #[prost(uint32, tag = "1")]
    pub type_id: CommandTypeId,

    #[prost(uint32, tag = "2")]
    pub player_number: u32,

    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Client → server entry for one turn.
///
/// A submission without `command` is a heartbeat.
#[derive(Clone, PartialEq, Message)]
pub struct SubmitCommandProto {
    #[prost(uint64, tag = "1")]
    pub turn: Turn,

    /// Per-client sequence number; zero for heartbeats.
    #[prost(uint32, tag = "2")]
    pub seq: CommandSeq,

    #[prost(message, optional, tag = "3")]
    pub command: Option<CommandProto>,
}

/// A closed turn, commands in ascending player order.
#[derive(Clone, PartialEq, Message)]
pub struct TurnProto {
    #[prost(uint64, tag = "1")]
    pub turn: Turn,

    #[prost(message, repeated, tag = "2")]
    pub commands: Vec<CommandProto>,
}

/// `count` consecutive closed turns with no commands.
#[derive(Clone, PartialEq, Message)]
pub struct EmptyTurnsProto {
    #[prost(uint64, tag = "1")]
    pub first_turn: Turn,

    #[prost(uint32, tag = "2")]
    pub count: u32,
}

/// Client → server: every turn up to `turn` has been received.
#[derive(Clone, PartialEq, Message)]
pub struct TurnAckProto {
    #[prost(uint64, tag = "1")]
    pub turn: Turn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RejectionReason {
    Unspecified = 0,
    TooLate = 1,
    TooEarly = 2,
}

/// Server → client: submission `seq` fell outside the window.
#[derive(Clone, PartialEq, Message)]
pub struct CommandRejectedProto {
    #[prost(uint64, tag = "1")]
    pub turn: Turn,

    #[prost(uint32, tag = "2")]
    pub seq: CommandSeq,

    #[prost(enumeration = "RejectionReason", tag = "3")]
    pub reason: i32,

    /// Server's last closed turn when the submission was checked.
    #[prost(uint64, tag = "4")]
    pub last_closed_turn: Turn,
}

impl CommandRejectedProto {
    pub fn new(turn: Turn, seq: CommandSeq, rejection: Rejection, last_closed_turn: Turn) -> Self {
        Self {
            turn,
            seq,
            reason: RejectionReason::from(rejection) as i32,
            last_closed_turn,
        }
    }

    pub fn rejection(&self) -> Result<Rejection, WireError> {
        let reason = RejectionReason::try_from(self.reason)
            .map_err(|_| WireError::UnknownRejectionReason(self.reason))?;
        Rejection::try_from(reason)
    }
}

// ============================================================================
// Session Messages
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct LockstepConfigProto {
    #[prost(uint32, tag = "1")]
    pub simulation_step_ms: u32,

    #[prost(uint32, tag = "2")]
    pub command_step_factor: u32,

    #[prost(uint32, tag = "3")]
    pub min_execution_turn_anticipation: u32,

    #[prost(uint32, tag = "4")]
    pub max_execution_turn_anticipation: u32,

    #[prost(uint32, tag = "5")]
    pub execution_turn_anticipation: u32,

    #[prost(uint32, tag = "6")]
    pub max_retries: u32,

    #[prost(uint32, tag = "7")]
    pub players_count: u32,

    #[prost(uint32, tag = "8")]
    pub start_delay_ms: u32,

    #[prost(uint32, tag = "9")]
    pub max_simulation_steps_per_tick: u32,

    #[prost(uint32, tag = "10")]
    pub retire_grace_turns: u32,
}

/// Server → client: assigned player number and session config.
#[derive(Clone, PartialEq, Message)]
pub struct ClientSetupProto {
    #[prost(uint32, tag = "1")]
    pub player_number: u32,

    #[prost(message, optional, tag = "2")]
    pub config: Option<LockstepConfigProto>,
}

/// Client → server: ready to play.
#[derive(Clone, PartialEq, Message)]
pub struct PlayerReadyProto {
    /// Stable token identifying the player across reconnects.
    #[prost(string, tag = "1")]
    pub player_id: String,

    /// Last turn the client executed (0 on a first join).
    #[prost(uint64, tag = "2")]
    pub current_turn: Turn,
}

/// Server → clients: start executing after `start_turn`.
#[derive(Clone, PartialEq, Message)]
pub struct ClientStartProto {
    #[prost(uint64, tag = "1")]
    pub start_turn: Turn,

    #[prost(uint32, tag = "2")]
    pub start_delay_ms: u32,

    /// Player id tokens indexed by player number.
    #[prost(string, repeated, tag = "3")]
    pub player_ids: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ParticipantStatusProto {
    #[prost(uint32, tag = "1")]
    pub player_number: u32,

    #[prost(bool, tag = "2")]
    pub connected: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerErrorProto {
    /// See [`error_code`].
    #[prost(uint32, tag = "1")]
    pub code: u32,

    #[prost(string, tag = "2")]
    pub message: String,

    /// Turn the error relates to, 0 if none.
    #[prost(uint64, tag = "3")]
    pub turn: Turn,
}

// ============================================================================
// Replay Artifact
// ============================================================================

/// Complete record of an executed match.
#[derive(Clone, PartialEq, Message)]
pub struct ReplayArtifact {
    /// Schema version (starts at 1).
    #[prost(uint32, tag = "1")]
    pub replay_format_version: u32,

    #[prost(message, optional, tag = "2")]
    pub config: Option<LockstepConfigProto>,

    /// Last executed turn before the first recorded turn.
    #[prost(uint64, tag = "3")]
    pub start_turn: Turn,

    #[prost(uint64, tag = "4")]
    pub final_turn: Turn,

    /// Every executed turn in order, empty turns included.
    #[prost(message, repeated, tag = "5")]
    pub turns: Vec<TurnProto>,

    #[prost(string, tag = "6")]
    pub stream_digest_algo_id: String,

    /// Command-stream digest after `final_turn`.
    #[prost(uint64, tag = "7")]
    pub stream_digest: u64,

    /// SHA-256 (lowercase hex) of the recorded turns as command frames.
    #[prost(string, tag = "8")]
    pub turn_stream_sha256: String,

    #[prost(string, repeated, tag = "9")]
    pub player_ids: Vec<String>,

    /// Game-supplied hash of the simulation state after `final_turn`.
    #[prost(uint64, optional, tag = "10")]
    pub final_state_digest: Option<u64>,
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&Command> for CommandProto {
    fn from(c: &Command) -> Self {
        Self {
            type_id: c.type_id,
            player_number: u32::from(c.player),
            payload: c.payload.clone(),
        }
    }
}

impl TryFrom<CommandProto> for Command {
    type Error = WireError;

    fn try_from(c: CommandProto) -> Result<Self, Self::Error> {
        Ok(Self::new(
            c.type_id,
            player_number("player_number", c.player_number)?,
            c.payload,
        ))
    }
}

impl From<&Submission> for SubmitCommandProto {
    fn from(s: &Submission) -> Self {
        Self {
            turn: s.turn,
            seq: s.seq,
            command: s.command.as_ref().map(Into::into),
        }
    }
}

impl TryFrom<SubmitCommandProto> for Submission {
    type Error = WireError;

    fn try_from(s: SubmitCommandProto) -> Result<Self, Self::Error> {
        Ok(Self {
            turn: s.turn,
            seq: s.seq,
            command: s.command.map(TryInto::try_into).transpose()?,
        })
    }
}

impl From<&ClosedTurn> for TurnProto {
    fn from(t: &ClosedTurn) -> Self {
        Self {
            turn: t.turn(),
            commands: t.commands().iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<TurnProto> for ClosedTurn {
    type Error = WireError;

    fn try_from(t: TurnProto) -> Result<Self, Self::Error> {
        let commands: Result<Vec<Command>, _> =
            t.commands.into_iter().map(TryInto::try_into).collect();
        Ok(Self::new(t.turn, commands?)?)
    }
}

impl From<&LockstepConfig> for LockstepConfigProto {
    fn from(c: &LockstepConfig) -> Self {
        Self {
            simulation_step_ms: c.simulation_step_ms,
            command_step_factor: c.command_step_factor,
            min_execution_turn_anticipation: c.min_execution_turn_anticipation,
            max_execution_turn_anticipation: c.max_execution_turn_anticipation,
            execution_turn_anticipation: c.execution_turn_anticipation,
            max_retries: c.max_retries,
            players_count: u32::from(c.players_count),
            start_delay_ms: c.start_delay_ms,
            max_simulation_steps_per_tick: c.max_simulation_steps_per_tick,
            retire_grace_turns: c.retire_grace_turns,
        }
    }
}

impl TryFrom<LockstepConfigProto> for LockstepConfig {
    type Error = WireError;

    fn try_from(c: LockstepConfigProto) -> Result<Self, Self::Error> {
        let config = Self {
            simulation_step_ms: c.simulation_step_ms,
            command_step_factor: c.command_step_factor,
            min_execution_turn_anticipation: c.min_execution_turn_anticipation,
            max_execution_turn_anticipation: c.max_execution_turn_anticipation,
            execution_turn_anticipation: c.execution_turn_anticipation,
            max_retries: c.max_retries,
            players_count: u8::try_from(c.players_count).map_err(|_| WireError::OutOfRange {
                field: "players_count",
                value: u64::from(c.players_count),
            })?,
            start_delay_ms: c.start_delay_ms,
            max_simulation_steps_per_tick: c.max_simulation_steps_per_tick,
            retire_grace_turns: c.retire_grace_turns,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ClientSetupProto {
    pub fn new(player: PlayerNumber, config: &LockstepConfig) -> Self {
        Self {
            player_number: u32::from(player),
            config: Some(config.into()),
        }
    }

    /// Split into the assigned player number and a validated config.
    pub fn into_parts(self) -> Result<(PlayerNumber, LockstepConfig), WireError> {
        let player = player_number("player_number", self.player_number)?;
        let config = self.config.ok_or(WireError::MissingField("config"))?;
        Ok((player, config.try_into()?))
    }
}

impl From<Rejection> for RejectionReason {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::TooLate => Self::TooLate,
            Rejection::TooEarly => Self::TooEarly,
        }
    }
}

impl TryFrom<RejectionReason> for Rejection {
    type Error = WireError;

    fn try_from(r: RejectionReason) -> Result<Self, Self::Error> {
        match r {
            RejectionReason::TooLate => Ok(Self::TooLate),
            RejectionReason::TooEarly => Ok(Self::TooEarly),
            RejectionReason::Unspecified => Err(WireError::UnknownRejectionReason(r as i32)),
        }
    }
}

impl ParticipantStatusProto {
    pub fn player(&self) -> Result<PlayerNumber, WireError> {
        player_number("player_number", self.player_number)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_roundtrip() {
        let submission = Submission::command(12, 7, Command::new(3, 1, vec![9, 8, 7]));
        let encoded = SubmitCommandProto::from(&submission).encode_to_vec();
        let decoded: Submission = decode::<SubmitCommandProto>(&encoded)
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(decoded, submission);
    }

    #[test]
    fn test_heartbeat_has_no_command() {
        let proto = SubmitCommandProto::from(&Submission::heartbeat(4));
        assert!(proto.command.is_none());
        let back = Submission::try_from(proto).unwrap();
        assert!(back.is_heartbeat());
    }

    #[test]
    fn test_turn_conversion_restores_player_order() {
        let proto = TurnProto {
            turn: 5,
            commands: vec![
                CommandProto {
                    type_id: 1,
                    player_number: 2,
                    payload: vec![],
                },
                CommandProto {
                    type_id: 1,
                    player_number: 0,
                    payload: vec![1],
                },
            ],
        };
        let turn = ClosedTurn::try_from(proto).unwrap();
        let players: Vec<_> = turn.commands().iter().map(|c| c.player).collect();
        assert_eq!(players, vec![0, 2]);
    }

    #[test]
    fn test_turn_with_duplicate_player_is_rejected() {
        let command = CommandProto {
            type_id: 1,
            player_number: 1,
            payload: vec![],
        };
        let proto = TurnProto {
            turn: 5,
            commands: vec![command.clone(), command],
        };
        assert!(matches!(
            ClosedTurn::try_from(proto),
            Err(WireError::Turn(TurnError::DuplicatePlayer { turn: 5, player: 1 }))
        ));
    }

    #[test]
    fn test_player_number_out_of_range() {
        let proto = CommandProto {
            type_id: 1,
            player_number: 256,
            payload: vec![],
        };
        assert!(matches!(
            Command::try_from(proto),
            Err(WireError::OutOfRange {
                field: "player_number",
                value: 256
            })
        ));
    }

    #[test]
    fn test_client_setup_carries_validated_config() {
        let mut config = LockstepConfig::default();
        config.players_count = 4;
        let setup = ClientSetupProto::new(3, &config);

        let decoded = decode::<ClientSetupProto>(&setup.encode_to_vec()).unwrap();
        assert_eq!(decoded.into_parts().unwrap(), (3, config));
    }

    #[test]
    fn test_client_setup_rejects_invalid_config() {
        let mut proto = LockstepConfigProto::from(&LockstepConfig::default());
        proto.command_step_factor = 0;
        let setup = ClientSetupProto {
            player_number: 0,
            config: Some(proto),
        };
        assert!(matches!(setup.into_parts(), Err(WireError::Config(_))));

        let missing = ClientSetupProto {
            player_number: 0,
            config: None,
        };
        assert!(matches!(
            missing.into_parts(),
            Err(WireError::MissingField("config"))
        ));
    }

    #[test]
    fn test_rejection_reason_mapping() {
        let proto = CommandRejectedProto::new(9, 4, Rejection::TooEarly, 6);
        assert_eq!(proto.reason, 2);
        assert_eq!(proto.rejection().unwrap(), Rejection::TooEarly);

        let unknown = CommandRejectedProto {
            reason: 17,
            ..proto.clone()
        };
        assert!(matches!(
            unknown.rejection(),
            Err(WireError::UnknownRejectionReason(17))
        ));

        let unspecified = CommandRejectedProto { reason: 0, ..proto };
        assert!(unspecified.rejection().is_err());
    }

    #[test]
    fn test_decode_error_names_message() {
        let err = decode::<TurnProto>(&[0xff, 0xff, 0xff]).unwrap_err();
        match err {
            WireError::Decode { message, .. } => assert_eq!(message, "TurnProto"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_msg_type_names() {
        assert_eq!(msg_type::name(msg_type::TURN), Some("Turn"));
        assert_eq!(msg_type::name(msg_type::SERVER_ERROR), Some("ServerError"));
        assert_eq!(msg_type::name(1), None);
    }
}
