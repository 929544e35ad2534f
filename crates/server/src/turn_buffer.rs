//! Turn buffer.
//!
//! Collects per-player submissions for upcoming turns and freezes them into
//! [`ClosedTurn`]s. Each turn moves through
//!
//! ```text
//! Open ──► Closing { waited } ──► Closed ──► Executed ──► (retired)
//! ```
//!
//! - **Open**: accepting submissions inside the anticipation window.
//! - **Closing**: due, but at least one connected participant has neither
//!   submitted nor exhausted its retries.
//! - **Closed**: frozen; its content never changes again.
//! - **Executed**: applied by the authoritative simulation.
//! - **Retired**: dropped once every participant, connected or not,
//!   acknowledged it, or once it falls `retire_grace_turns` behind the last
//!   closed turn.
//!
//! Turns close strictly in order, one command step making at most one more
//! turn due. A command step that finds the oldest due turn waiting on a
//! participant counts one retry against that participant; at `max_retries`
//! the participant contributes an implicit no-op and the turn closes.

use std::collections::BTreeMap;

use lockstep_sim::{ClosedTurn, Command, CommandSeq, LockstepConfig, PlayerNumber, Submission, Turn};
use lockstep_wire::transport::ClientId;
use tracing::{debug, trace};

use crate::participant::{JoinError, Joined, ParticipantArena};
use crate::window::{Admission, check_window};

/// Buffer parameters taken from the session config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub execution_turn_anticipation: u32,
    pub max_retries: u32,
    pub retire_grace_turns: u32,
    pub players_count: u8,
}

impl From<&LockstepConfig> for BufferConfig {
    fn from(config: &LockstepConfig) -> Self {
        Self {
            execution_turn_anticipation: config.execution_turn_anticipation,
            max_retries: config.max_retries,
            retire_grace_turns: config.retire_grace_turns,
            players_count: config.players_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Open,
    Closing { waited: u32 },
    Closed,
    Executed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Heartbeat,
    Command { seq: CommandSeq, command: Command },
}

#[derive(Debug, Clone)]
struct TurnEntry {
    phase: TurnPhase,
    slots: BTreeMap<PlayerNumber, Slot>,
    closed: Option<ClosedTurn>,
}

impl TurnEntry {
    fn open() -> Self {
        Self {
            phase: TurnPhase::Open,
            slots: BTreeMap::new(),
            closed: None,
        }
    }

    fn is_frozen(&self) -> bool {
        matches!(self.phase, TurnPhase::Closed | TurnPhase::Executed)
    }
}

/// Server-side turn buffer.
#[derive(Debug, Clone)]
pub struct TurnBuffer {
    config: BufferConfig,
    participants: ParticipantArena,
    turns: BTreeMap<Turn, TurnEntry>,
    started: bool,
    last_closed: Turn,
    /// Highest turn allowed to close so far.
    due: Turn,
    executed: Turn,
}

impl TurnBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            participants: ParticipantArena::new(config.players_count),
            config,
            turns: BTreeMap::new(),
            started: false,
            last_closed: 0,
            due: 0,
            executed: 0,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------------

    pub fn participants(&self) -> &ParticipantArena {
        &self.participants
    }

    pub fn participants_mut(&mut self) -> &mut ParticipantArena {
        &mut self.participants
    }

    pub fn join(&mut self, player_id: &str, client: Option<ClientId>) -> Result<Joined, JoinError> {
        let joined = self.participants.join(player_id, client)?;
        debug!(player = joined.player(), player_id, ?client, "participant joined");
        Ok(joined)
    }

    /// Disconnect `player` and drop its slots from every unfrozen turn.
    ///
    /// Turns waiting on it can close at the next command step.
    pub fn disconnect(&mut self, player: PlayerNumber) -> bool {
        if !self.participants.disconnect(player) {
            return false;
        }
        let mut dropped = 0;
        for entry in self.turns.values_mut().filter(|e| !e.is_frozen()) {
            if entry.slots.remove(&player).is_some() {
                dropped += 1;
            }
        }
        debug!(player, dropped, "participant disconnected");
        true
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start accepting submissions with `turn` as the last closed turn.
    pub fn start(&mut self, turn: Turn) {
        self.started = true;
        self.last_closed = turn;
        self.due = turn;
        self.executed = turn;
        self.turns.retain(|t, _| *t > turn);
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn last_closed(&self) -> Turn {
        self.last_closed
    }

    pub fn executed(&self) -> Turn {
        self.executed
    }

    pub fn phase(&self, turn: Turn) -> Option<TurnPhase> {
        self.turns.get(&turn).map(|e| e.phase)
    }

    /// A closed turn still held by the buffer.
    pub fn closed_turn(&self, turn: Turn) -> Option<&ClosedTurn> {
        self.turns.get(&turn).and_then(|e| e.closed.as_ref())
    }

    /// Whether every closed turn after `turn` is still retained.
    pub fn can_resend_from(&self, turn: Turn) -> bool {
        turn <= self.last_closed && (turn + 1..=self.last_closed).all(|t| self.closed_turn(t).is_some())
    }

    // ------------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------------

    /// Store `submission` from `player`.
    ///
    /// The command, if any, must already carry `player` as its issuer.
    pub fn submit(&mut self, player: PlayerNumber, submission: Submission) -> Admission {
        if !self.started {
            return Admission::NotStarted;
        }
        let Some(participant) = self.participants.get(player) else {
            return Admission::UnknownParticipant;
        };
        if !participant.connected {
            return Admission::Disconnected;
        }
        if !submission.is_heartbeat() && submission.seq <= participant.closed_seq {
            return Admission::Duplicate;
        }
        if let Err(rejection) = check_window(
            submission.turn,
            self.last_closed,
            self.config.execution_turn_anticipation,
        ) {
            return rejection.into();
        }

        let entry = self
            .turns
            .entry(submission.turn)
            .or_insert_with(TurnEntry::open);
        let incoming = match submission.command {
            Some(command) => Slot::Command {
                seq: submission.seq,
                command,
            },
            None => Slot::Heartbeat,
        };

        let admission = match (entry.slots.get(&player), &incoming) {
            (None, _) => Admission::Accepted,
            (Some(Slot::Heartbeat), Slot::Heartbeat) => Admission::Duplicate,
            (Some(Slot::Heartbeat), Slot::Command { .. }) => Admission::Replaced,
            (Some(Slot::Command { .. }), Slot::Heartbeat) => Admission::HeartbeatSuperseded,
            (Some(Slot::Command { seq: held, .. }), Slot::Command { seq, .. }) => {
                if seq > held {
                    Admission::Replaced
                } else {
                    Admission::Duplicate
                }
            }
        };
        if admission.is_accepted() {
            entry.slots.insert(player, incoming);
        }
        trace!(player, turn = submission.turn, admission = admission.as_str(), "submission");
        admission
    }

    // ------------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------------

    /// Run one command step: make one more turn due and close every due
    /// turn that is ready, in order.
    pub fn advance(&mut self) -> Vec<ClosedTurn> {
        if !self.started {
            return Vec::new();
        }
        self.due += 1;

        let mut closed = Vec::new();
        while self.last_closed < self.due {
            match self.try_close(self.last_closed + 1) {
                Some(turn) => closed.push(turn),
                None => break,
            }
        }
        closed
    }

    fn try_close(&mut self, turn: Turn) -> Option<ClosedTurn> {
        let max_retries = self.config.max_retries;
        let entry = self.turns.entry(turn).or_insert_with(TurnEntry::open);

        let mut waiting = false;
        for participant in self.participants.iter_mut().filter(|p| p.connected) {
            if entry.slots.contains_key(&participant.player) {
                continue;
            }
            if participant.retries < max_retries {
                participant.retries += 1;
                waiting = true;
            }
        }

        if waiting {
            let waited = match entry.phase {
                TurnPhase::Closing { waited } => waited + 1,
                _ => 1,
            };
            entry.phase = TurnPhase::Closing { waited };
            trace!(turn, waited, "turn waiting on participants");
            return None;
        }

        let mut commands = BTreeMap::new();
        for (player, slot) in std::mem::take(&mut entry.slots) {
            if let Slot::Command { seq, command } = slot {
                if let Some(participant) = self.participants.get_mut(player) {
                    participant.closed_seq = participant.closed_seq.max(seq);
                }
                commands.insert(player, command);
            }
        }
        let closed = ClosedTurn::from_slots(turn, commands);
        entry.phase = TurnPhase::Closed;
        entry.closed = Some(closed.clone());

        for participant in self.participants.iter_mut() {
            participant.retries = 0;
        }
        self.last_closed = turn;
        debug!(turn, commands = closed.len(), "turn closed");
        Some(closed)
    }

    // ------------------------------------------------------------------------
    // Execution and Retirement
    // ------------------------------------------------------------------------

    /// The authoritative simulation executed every turn up to `turn`.
    pub fn mark_executed(&mut self, turn: Turn) {
        let turn = turn.min(self.last_closed);
        for (_, entry) in self.turns.range_mut(..=turn) {
            if entry.phase == TurnPhase::Closed {
                entry.phase = TurnPhase::Executed;
            }
        }
        self.executed = self.executed.max(turn);
    }

    /// Record that `player` holds every turn up to `turn`.
    pub fn acknowledge(&mut self, player: PlayerNumber, turn: Turn) -> bool {
        let last_closed = self.last_closed;
        match self.participants.get_mut(player) {
            Some(participant) => {
                participant.acked = participant.acked.max(turn.min(last_closed));
                true
            }
            None => false,
        }
    }

    /// Drop executed turns nobody needs anymore. Returns how many went.
    pub fn retire(&mut self) -> usize {
        // Disconnected participants hold turns too, so a rejoin can resume.
        let acked = self
            .participants
            .iter()
            .map(|p| p.acked)
            .min()
            .unwrap_or(self.executed);
        let grace = u64::from(self.config.retire_grace_turns);
        let last_closed = self.last_closed;

        let before = self.turns.len();
        self.turns.retain(|turn, entry| {
            let retirable = entry.phase == TurnPhase::Executed
                && (*turn <= acked || turn.saturating_add(grace) <= last_closed);
            !retirable
        });
        let retired = before - self.turns.len();
        if retired > 0 {
            trace!(retired, acked, "turns retired");
        }
        retired
    }

    /// Turns currently held, in any phase.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
