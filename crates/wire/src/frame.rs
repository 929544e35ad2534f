//! Fixed binary command frames.
//!
//! ```text
//! type_id: u32 LE | player: u8 | payload_len: u32 LE | payload
//! ```
//!
//! Same fields as [`CommandProto`](crate::CommandProto), but with a stable
//! byte layout independent of protobuf encoding choices. Used wherever
//! turns are hashed.

use lockstep_sim::{ClosedTurn, Command};

use crate::WireError;

/// Bytes before the payload.
pub const HEADER_LEN: usize = 9;

pub fn encode_command(command: &Command, out: &mut Vec<u8>) -> Result<(), WireError> {
    let payload_len = length_u32("payload_len", command.payload.len())?;
    out.reserve(HEADER_LEN + command.payload.len());
    out.extend_from_slice(&command.type_id.to_le_bytes());
    out.push(command.player);
    out.extend_from_slice(&payload_len.to_le_bytes());
    out.extend_from_slice(&command.payload);
    Ok(())
}

/// Frame a closed turn: turn number (u64 LE), command count (u32 LE), then
/// each command frame in player order.
pub fn encode_turn(turn: &ClosedTurn, out: &mut Vec<u8>) -> Result<(), WireError> {
    let count = length_u32("command_count", turn.len())?;
    out.extend_from_slice(&turn.turn().to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    for command in turn.commands() {
        encode_command(command, out)?;
    }
    Ok(())
}

fn length_u32(field: &'static str, len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::OutOfRange {
        field,
        value: len as u64,
    })
}

// ============================================================================
// Tests
// ============================================================================
