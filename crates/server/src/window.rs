//! Anticipation window checks.
//!
//! A submission for turn `T` is accepted iff
//! `last_closed < T <= last_closed + anticipation`:
//! - `T <= last_closed`: too late, the turn is already frozen
//! - `T > last_closed + anticipation`: too early, beyond the horizon

use lockstep_sim::{Rejection, Turn};

/// Check `turn` against the window anchored at `last_closed`.
pub fn check_window(turn: Turn, last_closed: Turn, anticipation: u32) -> Result<(), Rejection> {
    if turn <= last_closed {
        return Err(Rejection::TooLate);
    }
    if turn > last_closed.saturating_add(u64::from(anticipation)) {
        return Err(Rejection::TooEarly);
    }
    Ok(())
}

/// What the turn buffer did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored in an empty slot.
    Accepted,
    /// A command replaced a heartbeat or an older command.
    Replaced,
    /// A heartbeat arrived for a slot already holding a command.
    HeartbeatSuperseded,
    /// Already seen; dropped without a reply.
    Duplicate,
    TooLate,
    TooEarly,
    /// The match has not started.
    NotStarted,
    UnknownParticipant,
    Disconnected,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted | Self::Replaced)
    }

    /// The rejection to report back to the sender, if any.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::TooLate => Some(Rejection::TooLate),
            Self::TooEarly => Some(Rejection::TooEarly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Replaced => "replaced",
            Self::HeartbeatSuperseded => "heartbeat_superseded",
            Self::Duplicate => "duplicate",
            Self::TooLate => "too_late",
            Self::TooEarly => "too_early",
            Self::NotStarted => "not_started",
            Self::UnknownParticipant => "unknown_participant",
            Self::Disconnected => "disconnected",
        }
    }
}

impl From<Rejection> for Admission {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::TooLate => Self::TooLate,
            Rejection::TooEarly => Self::TooEarly,
        }
    }
}
