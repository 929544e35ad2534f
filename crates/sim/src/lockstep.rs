//! Lockstep facade.
//!
//! [`Lockstep`] is what a game embeds. It owns the simulation state, the
//! command registry of its execution path and the turn pipeline:
//!
//! ```text
//! add_pending_command ──► pending ──► outbox ──► (network) ──► confirm_turn
//!                                                                  │
//!       step_simulation: tick, tick, ..., boundary ──► execute turn ◄┘
//! ```
//!
//! Three roles share the same execution code:
//! - [`Role::Offline`]: no network; local commands target the next turn and
//!   every turn is implicitly confirmed.
//! - [`Role::Participant`]: a networked client. Local commands go to the
//!   outbox, and the simulation blocks on any boundary whose turn has not
//!   been confirmed by the server yet.
//! - [`Role::Authority`]: the server's own copy of the simulation. It has no
//!   player number and only executes what the turn buffer closed.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::anticipation::AnticipationTuner;
use crate::command::{ClosedTurn, Command, CommandPayload, Rejection, Submission};
use crate::config::LockstepConfig;
use crate::error::{CommandError, ConfigError, LockstepError, SubmitError};
use crate::registry::CommandRegistry;
use crate::scheduler::{StepOutcome, TickContext};
use crate::{CommandSeq, CommandTypeId, PlayerNumber, SimTick, StreamDigest, Turn};

type Completion<S> = Box<dyn FnOnce(&Command, &mut S)>;
type SimulationHook<S> = Box<dyn FnMut(SimTick, &mut S)>;

// ============================================================================
// Public Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offline,
    Participant,
    Authority,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Participant => "participant",
            Self::Authority => "authority",
        }
    }
}

/// Outcome of queueing a local command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Queued for `turn` under sequence number `seq`.
    Scheduled { seq: CommandSeq, turn: Turn },
    /// The lockstep is not running; the completion already ran.
    Immediate,
}

/// Things the host may want to react to, drained with
/// [`Lockstep::drain_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum LockstepEvent {
    Started {
        turn: Turn,
    },
    /// A turn finished executing. Carries the exact commands applied.
    TurnApplied(ClosedTurn),
    /// One command of a turn failed; the rest of the turn still ran.
    CommandFailed {
        turn: Turn,
        player: PlayerNumber,
        type_id: CommandTypeId,
        error: CommandError,
    },
    /// A local command ran out of retries and was dropped.
    CommandDiscarded {
        seq: CommandSeq,
        type_id: CommandTypeId,
    },
    /// The simulation reached the boundary of an unconfirmed turn.
    Stalled {
        turn: Turn,
    },
    Resumed {
        turn: Turn,
        stalled_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockstepStats {
    pub executed_turns: u64,
    pub executed_commands: u64,
    pub failed_commands: u64,
    pub discarded_commands: u64,
    pub resubmitted_commands: u64,
    pub stalls: u64,
    /// Real time spent blocked on unconfirmed turns.
    pub stalled_ms: u64,
}

struct PendingCommand<S> {
    turn: Turn,
    command: Command,
    retries: u32,
    completion: Option<Completion<S>>,
}

// ============================================================================
// Lockstep
// ============================================================================

pub struct Lockstep<S> {
    config: LockstepConfig,
    role: Role,
    player: Option<PlayerNumber>,
    registry: CommandRegistry<S>,
    state: S,
    simulation: Option<SimulationHook<S>>,

    running: bool,
    tick: SimTick,
    executed: Turn,
    confirmed: BTreeMap<Turn, ClosedTurn>,

    pending: BTreeMap<CommandSeq, PendingCommand<S>>,
    outbox: Vec<Submission>,
    next_seq: CommandSeq,
    last_target: Turn,
    heartbeat_through: Turn,
    tuner: AnticipationTuner,

    digest: StreamDigest,
    events: Vec<LockstepEvent>,
    stalled_on: Option<Turn>,
    stalled_ms: u64,
    stats: LockstepStats,
}

impl<S> Lockstep<S> {
    /// Single-player lockstep without a network.
    pub fn offline(
        config: LockstepConfig,
        player: PlayerNumber,
        state: S,
    ) -> Result<Self, ConfigError> {
        Self::with_role(config, Role::Offline, Some(player), state)
    }

    /// Networked client; the player number arrives with the server's setup.
    pub fn participant(config: LockstepConfig, state: S) -> Result<Self, ConfigError> {
        Self::with_role(config, Role::Participant, None, state)
    }

    /// The server's authoritative simulation.
    pub fn authority(config: LockstepConfig, state: S) -> Result<Self, ConfigError> {
        Self::with_role(config, Role::Authority, None, state)
    }

    fn with_role(
        config: LockstepConfig,
        role: Role,
        player: Option<PlayerNumber>,
        state: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            tuner: AnticipationTuner::from_config(&config),
            config,
            role,
            player,
            registry: CommandRegistry::new(),
            state,
            simulation: None,
            running: false,
            tick: 0,
            executed: 0,
            confirmed: BTreeMap::new(),
            pending: BTreeMap::new(),
            outbox: Vec::new(),
            next_seq: 1,
            last_target: 0,
            heartbeat_through: 0,
            digest: StreamDigest::new(),
            events: Vec::new(),
            stalled_on: None,
            stalled_ms: 0,
            stats: LockstepStats::default(),
        })
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Replace the configuration. Only allowed while stopped.
    pub fn set_config(&mut self, config: LockstepConfig) -> Result<(), LockstepError> {
        if self.running {
            return Err(LockstepError::AlreadyRunning);
        }
        config.validate()?;
        self.tuner = AnticipationTuner::from_config(&config);
        self.config = config;
        Ok(())
    }

    /// Assign the local player number. It cannot change while running.
    pub fn set_player_number(&mut self, player: PlayerNumber) -> Result<(), LockstepError> {
        match self.player {
            Some(current) if self.running && current != player => {
                Err(LockstepError::PlayerNumberFixed(current))
            }
            _ => {
                self.player = Some(player);
                Ok(())
            }
        }
    }

    /// Attach logic to command type `C` on this execution path only.
    pub fn register_command_logic<C, F>(&mut self, handler: F)
    where
        C: CommandPayload,
        F: FnMut(&C, PlayerNumber, &mut S) -> Result<(), CommandError> + 'static,
    {
        self.registry.register_logic::<C, F>(handler);
    }

    /// Make `C` known (so it can be submitted and validated) without logic.
    pub fn register_command<C: CommandPayload>(&mut self) -> bool {
        self.registry.register_command::<C>()
    }

    pub fn registry(&self) -> &CommandRegistry<S> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CommandRegistry<S> {
        &mut self.registry
    }

    /// Per-tick simulation hook, run on every advanced tick before the turn
    /// that tick may execute.
    pub fn set_simulation<F>(&mut self, simulation: F)
    where
        F: FnMut(SimTick, &mut S) + 'static,
    {
        self.simulation = Some(Box::new(simulation));
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start (or restart) with `turn` as the last executed turn.
    ///
    /// Confirmed turns at or before `turn` are dropped and local commands
    /// that can no longer land are resubmitted.
    pub fn start(&mut self, turn: Turn) {
        self.running = true;
        self.executed = turn;
        self.tick = self.config.turn_boundary(turn);
        self.confirmed.retain(|t, _| *t > turn);
        self.last_target = self.last_target.max(turn);
        self.heartbeat_through = turn;
        self.stalled_on = None;
        self.stalled_ms = 0;

        let stale: Vec<CommandSeq> = self
            .pending
            .iter()
            .filter(|(_, p)| p.turn <= turn)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale {
            self.retry(seq, turn + 1);
        }

        info!(turn, role = self.role.as_str(), player = ?self.player, "lockstep started");
        self.events.push(LockstepEvent::Started { turn });

        if self.role == Role::Participant {
            self.fill_heartbeats();
        }
    }

    pub fn stop(&mut self) {
        if self.running {
            info!(turn = self.executed, role = self.role.as_str(), "lockstep stopped");
        }
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // ------------------------------------------------------------------------
    // Local Commands
    // ------------------------------------------------------------------------

    /// Queue a local command for a future turn.
    pub fn add_pending_command<C: CommandPayload>(
        &mut self,
        payload: &C,
    ) -> Result<Submitted, SubmitError> {
        self.queue_command(payload, None)
    }

    /// Queue a local command and run `on_applied` once it executes.
    ///
    /// When the lockstep is not running, `on_applied` runs right away and
    /// nothing is queued.
    pub fn add_pending_command_with<C, F>(
        &mut self,
        payload: &C,
        on_applied: F,
    ) -> Result<Submitted, SubmitError>
    where
        C: CommandPayload,
        F: FnOnce(&C, PlayerNumber, &mut S) + 'static,
    {
        let completion: Completion<S> =
            Box::new(move |command: &Command, state: &mut S| match command.decode::<C>() {
                Ok(payload) => on_applied(&payload, command.player, state),
                Err(err) => warn!(%err, "applied command no longer decodes, skipping completion"),
            });
        self.queue_command(payload, Some(completion))
    }

    fn queue_command<C: CommandPayload>(
        &mut self,
        payload: &C,
        completion: Option<Completion<S>>,
    ) -> Result<Submitted, SubmitError> {
        let player = self.player.ok_or(SubmitError::NoPlayerNumber)?;
        if !self.registry.factory().contains(C::TYPE_ID) {
            return Err(SubmitError::Unregistered(C::TYPE_ID));
        }
        let command = Command::from_payload(player, payload);

        if !self.running {
            if let Some(completion) = completion {
                completion(&command, &mut self.state);
            }
            return Ok(Submitted::Immediate);
        }

        let turn = self.next_target(self.executed + self.lead());
        let seq = self.enqueue(turn, command, 0, completion);
        Ok(Submitted::Scheduled { seq, turn })
    }

    /// Lead in turns for new local commands.
    fn lead(&self) -> Turn {
        match self.role {
            Role::Offline => 1,
            Role::Participant | Role::Authority => Turn::from(self.tuner.current()),
        }
    }

    /// Targets are strictly increasing so each turn holds at most one local
    /// command.
    fn next_target(&mut self, earliest: Turn) -> Turn {
        let turn = earliest.max(self.last_target + 1);
        self.last_target = turn;
        turn
    }

    fn enqueue(
        &mut self,
        turn: Turn,
        command: Command,
        retries: u32,
        completion: Option<Completion<S>>,
    ) -> CommandSeq {
        let seq = self.next_seq;
        self.next_seq += 1;

        debug!(seq, turn, type_id = command.type_id, retries, "command queued");
        if self.role == Role::Participant {
            self.outbox
                .push(Submission::command(turn, seq, command.clone()));
        }
        self.pending.insert(
            seq,
            PendingCommand {
                turn,
                command,
                retries,
                completion,
            },
        );
        seq
    }

    /// Resubmit `seq` for a turn no earlier than `floor`, or discard it once
    /// its retries are spent.
    fn retry(&mut self, seq: CommandSeq, floor: Turn) {
        let Some(pending) = self.pending.remove(&seq) else {
            return;
        };
        self.release_turn(pending.turn, floor);
        let type_id = pending.command.type_id;

        if pending.retries >= self.config.max_retries {
            warn!(seq, type_id, retries = pending.retries, "command discarded after retries");
            self.stats.discarded_commands += 1;
            self.events
                .push(LockstepEvent::CommandDiscarded { seq, type_id });
            return;
        }

        let earliest = (self.executed + self.lead()).max(floor);
        let turn = self.next_target(earliest);
        self.stats.resubmitted_commands += 1;
        let new_seq = self.enqueue(turn, pending.command, pending.retries + 1, pending.completion);
        debug!(seq, new_seq, turn, "command resubmitted");
    }

    /// A command leaving a still open `turn` took that turn's only submission
    /// with it. Rewind the heartbeat cursor so the next pass covers the turn
    /// once it is inside the server's window.
    fn release_turn(&mut self, turn: Turn, floor: Turn) {
        if self.role != Role::Participant || turn < floor || turn > self.heartbeat_through {
            return;
        }
        if self.pending.values().any(|p| p.turn == turn) {
            return;
        }
        self.heartbeat_through = self.heartbeat_through.min(turn - 1);
    }

    /// The server refused submission `seq`.
    ///
    /// Returns `false` when `seq` is not (or no longer) pending.
    pub fn on_command_rejected(
        &mut self,
        seq: CommandSeq,
        rejection: Rejection,
        last_closed: Turn,
    ) -> bool {
        if !self.pending.contains_key(&seq) {
            debug!(seq, "rejection for unknown submission");
            return false;
        }
        let lead = match rejection {
            Rejection::TooEarly => self.tuner.record_too_early(),
            Rejection::TooLate => self.tuner.record(false),
        };
        debug!(seq, reason = rejection.as_str(), last_closed, lead, "command rejected");
        self.retry(seq, last_closed + 1);
        true
    }

    // ------------------------------------------------------------------------
    // Turn Confirmation
    // ------------------------------------------------------------------------

    /// Hand over a turn closed by the server.
    ///
    /// Turns already executed or already confirmed are ignored, which makes
    /// duplicate deliveries harmless. Returns whether the turn was new.
    /// A participant drops turns beyond [`Lockstep::confirm_horizon`].
    pub fn confirm_turn(&mut self, turn: ClosedTurn) -> bool {
        let number = turn.turn();
        if number <= self.executed || self.confirmed.contains_key(&number) {
            debug!(turn = number, "ignoring duplicate turn");
            return false;
        }
        let horizon = self.confirm_horizon();
        if number > horizon {
            warn!(turn = number, executed = self.executed, horizon, "dropping turn beyond horizon");
            return false;
        }
        self.confirmed.insert(number, turn);
        true
    }

    /// Confirm `count` consecutive empty turns starting at `first`.
    pub fn confirm_empty_turns(&mut self, first: Turn, count: u32) -> usize {
        let end = first.saturating_add(u64::from(count));
        let horizon = self.confirm_horizon();
        if end > horizon.saturating_add(1) {
            warn!(first, count, horizon, "dropping empty turns beyond horizon");
        }

        let mut confirmed = 0;
        for turn in first..end.min(horizon.saturating_add(1)) {
            if self.confirm_turn(ClosedTurn::empty(turn)) {
                confirmed += 1;
            }
        }
        confirmed
    }

    /// Furthest turn held ahead of execution.
    ///
    /// A participant never needs more than the server retains plus the
    /// widest acceptance window. Offline and authoritative locksteps are fed
    /// locally and take any turn.
    pub fn confirm_horizon(&self) -> Turn {
        match self.role {
            Role::Participant => self
                .executed
                .saturating_add(u64::from(self.config.retire_grace_turns))
                .saturating_add(u64::from(self.config.max_execution_turn_anticipation)),
            Role::Offline | Role::Authority => Turn::MAX,
        }
    }

    /// Highest turn such that every turn up to it is executed or confirmed.
    pub fn confirmed_through(&self) -> Turn {
        let mut turn = self.executed;
        while self.confirmed.contains_key(&(turn + 1)) {
            turn += 1;
        }
        turn
    }

    fn is_turn_ready(&self, turn: Turn) -> bool {
        match self.role {
            Role::Offline => true,
            Role::Participant | Role::Authority => self.confirmed.contains_key(&turn),
        }
    }

    // ------------------------------------------------------------------------
    // Simulation
    // ------------------------------------------------------------------------

    /// Advance one simulation tick.
    ///
    /// On a turn boundary the turn executes right after the simulation hook.
    /// If that turn is not confirmed yet nothing happens and
    /// [`StepOutcome::Blocked`] is returned, so the scheduler keeps the time.
    pub fn step_simulation(&mut self, ctx: &TickContext) -> StepOutcome {
        if !self.running {
            return StepOutcome::Blocked;
        }

        let next_tick = self.tick + 1;
        let factor = u64::from(self.config.command_step_factor);
        let boundary = (next_tick % factor == 0).then_some(next_tick / factor);

        if let Some(turn) = boundary
            && !self.is_turn_ready(turn)
        {
            self.note_stall(turn, u64::from(ctx.real_delta_ms));
            return StepOutcome::Blocked;
        }

        if let Some(turn) = self.stalled_on.take() {
            let stalled_ms = std::mem::take(&mut self.stalled_ms);
            debug!(turn, stalled_ms, "simulation resumed");
            self.events
                .push(LockstepEvent::Resumed { turn, stalled_ms });
        }

        if let Some(simulate) = self.simulation.as_mut() {
            simulate(next_tick, &mut self.state);
        }
        self.tick = next_tick;

        if let Some(turn) = boundary {
            self.execute_turn(turn);
        }
        StepOutcome::Advanced
    }

    fn note_stall(&mut self, turn: Turn, real_delta_ms: u64) {
        if self.stalled_on.is_none() {
            debug!(turn, "simulation stalled waiting for turn");
            self.stalled_on = Some(turn);
            self.stats.stalls += 1;
            self.events.push(LockstepEvent::Stalled { turn });
        }
        self.stalled_ms += real_delta_ms;
        self.stats.stalled_ms += real_delta_ms;
    }

    fn execute_turn(&mut self, turn: Turn) {
        let closed = match self.role {
            Role::Offline => self.offline_turn(turn),
            Role::Participant | Role::Authority => self
                .confirmed
                .remove(&turn)
                .unwrap_or_else(|| ClosedTurn::empty(turn)),
        };

        for command in closed.commands() {
            self.digest.record(turn, command);
            match self.registry.dispatch(command, &mut self.state) {
                Ok(_) => self.stats.executed_commands += 1,
                Err(error) => {
                    warn!(turn, player = command.player, type_id = command.type_id, %error, "command failed");
                    self.stats.failed_commands += 1;
                    self.events.push(LockstepEvent::CommandFailed {
                        turn,
                        player: command.player,
                        type_id: command.type_id,
                        error,
                    });
                }
            }
        }

        self.executed = turn;
        self.stats.executed_turns += 1;
        self.settle_pending(&closed);

        debug!(turn, commands = closed.len(), role = self.role.as_str(), "turn executed");
        self.events.push(LockstepEvent::TurnApplied(closed));

        if self.role == Role::Participant {
            self.fill_heartbeats();
        }
    }

    /// Offline turns hold whatever local command targeted them.
    fn offline_turn(&self, turn: Turn) -> ClosedTurn {
        match self.pending.values().find(|p| p.turn == turn) {
            Some(pending) => ClosedTurn::from_slots(
                turn,
                BTreeMap::from([(pending.command.player, pending.command.clone())]),
            ),
            None => ClosedTurn::empty(turn),
        }
    }

    /// Resolve local commands whose target turn has now executed.
    fn settle_pending(&mut self, closed: &ClosedTurn) {
        let Some(player) = self.player else {
            return;
        };
        let turn = closed.turn();
        let due: Vec<CommandSeq> = self
            .pending
            .iter()
            .filter(|(_, p)| p.turn <= turn)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            let landed = self.pending.get(&seq).is_some_and(|p| {
                p.turn == turn && closed.command_of(player) == Some(&p.command)
            });

            if landed {
                if self.role == Role::Participant {
                    self.tuner.record(true);
                }
                if let Some(pending) = self.pending.remove(&seq)
                    && let Some(completion) = pending.completion
                {
                    completion(&pending.command, &mut self.state);
                }
            } else {
                if self.role == Role::Participant {
                    self.tuner.record(false);
                }
                debug!(seq, turn, "turn executed without local command");
                self.retry(seq, turn + 1);
            }
        }
    }

    /// Queue a heartbeat for each turn within the acceptance horizon that
    /// carries no local command, so the server need not wait for us.
    fn fill_heartbeats(&mut self) {
        let horizon = self.executed + u64::from(self.config.execution_turn_anticipation);
        let from = self.heartbeat_through.max(self.executed) + 1;
        for turn in from..=horizon {
            if !self.pending.values().any(|p| p.turn == turn) {
                self.outbox.push(Submission::heartbeat(turn));
            }
        }
        self.heartbeat_through = self.heartbeat_through.max(horizon);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn player_number(&self) -> Option<PlayerNumber> {
        self.player
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Last executed turn.
    pub fn current_turn(&self) -> Turn {
        self.executed
    }

    pub fn sim_tick(&self) -> SimTick {
        self.tick
    }

    pub fn digest(&self) -> StreamDigest {
        self.digest
    }

    /// Local commands queued but not applied yet.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Current lead used to target local commands.
    pub fn execution_anticipation(&self) -> u32 {
        self.tuner.current()
    }

    pub fn stats(&self) -> LockstepStats {
        self.stats
    }

    /// Submissions waiting to be sent to the server.
    pub fn drain_outbox(&mut self) -> Vec<Submission> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<LockstepEvent> {
        std::mem::take(&mut self.events)
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for Lockstep<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lockstep")
            .field("role", &self.role)
            .field("player", &self.player)
            .field("running", &self.running)
            .field("tick", &self.tick)
            .field("executed", &self.executed)
            .field("confirmed", &self.confirmed.len())
            .field("pending", &self.pending.len())
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use proptest::prelude::*;

    use super::*;
    use crate::error::PayloadError;
    use crate::scheduler::Scheduler;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Add(i32);

    impl CommandPayload for Add {
        const TYPE_ID: CommandTypeId = 1;
        const NAME: &'static str = "add";

        fn encode_payload(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadError> {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| PayloadError::Truncated {
                expected: 4,
                actual: bytes.len(),
            })?;
            Ok(Self(i32::from_le_bytes(raw)))
        }
    }

    #[derive(Debug, Default)]
    struct Board {
        applied: Vec<(PlayerNumber, i32)>,
        total: i32,
    }

    fn add_logic(add: &Add, player: PlayerNumber, board: &mut Board) -> Result<(), CommandError> {
        if add.0 < 0 {
            return Err(CommandError::rejected("negative"));
        }
        board.applied.push((player, add.0));
        board.total += add.0;
        Ok(())
    }

    fn step(lockstep: &mut Lockstep<Board>, ticks: u32) -> Vec<StepOutcome> {
        (0..ticks)
            .map(|i| lockstep.step_simulation(&TickContext::manual(u64::from(i) + 1)))
            .collect()
    }

    fn turn_of(turn: Turn, commands: &[(PlayerNumber, i32)]) -> ClosedTurn {
        ClosedTurn::new(
            turn,
            commands
                .iter()
                .map(|(player, value)| Command::from_payload(*player, &Add(*value)))
                .collect(),
        )
        .unwrap()
    }

    fn offline() -> Lockstep<Board> {
        let mut lockstep = Lockstep::offline(LockstepConfig::default(), 2, Board::default()).unwrap();
        lockstep.register_command_logic::<Add, _>(add_logic);
        lockstep
    }

    fn participant(player: PlayerNumber) -> Lockstep<Board> {
        let mut lockstep = Lockstep::participant(LockstepConfig::default(), Board::default()).unwrap();
        lockstep.set_player_number(player).unwrap();
        lockstep.register_command_logic::<Add, _>(add_logic);
        lockstep
    }

    fn authority() -> Lockstep<Board> {
        let mut lockstep = Lockstep::authority(LockstepConfig::default(), Board::default()).unwrap();
        lockstep.register_command_logic::<Add, _>(add_logic);
        lockstep
    }

    // ------------------------------------------------------------------------
    // Offline
    // ------------------------------------------------------------------------

    /// 33ms steps, factor 6: a command queued after two ticks lands on the
    /// first boundary (tick 6) and is applied exactly once.
    #[test]
    fn test_offline_command_applies_on_next_boundary() {
        let mut lockstep = offline();
        lockstep.start(0);

        step(&mut lockstep, 2);
        let submitted = lockstep.add_pending_command(&Add(5)).unwrap();
        assert_eq!(submitted, Submitted::Scheduled { seq: 1, turn: 1 });

        step(&mut lockstep, 3);
        assert_eq!(lockstep.sim_tick(), 5);
        assert!(lockstep.state().applied.is_empty());

        step(&mut lockstep, 1);
        assert_eq!(lockstep.current_turn(), 1);
        assert_eq!(lockstep.state().applied, vec![(2, 5)]);

        step(&mut lockstep, 12);
        assert_eq!(lockstep.state().applied, vec![(2, 5)]);
        assert_eq!(lockstep.pending_count(), 0);
        assert!(lockstep.drain_outbox().is_empty());
    }

    #[test]
    fn test_offline_driven_by_scheduler() {
        let mut lockstep = offline();
        let mut scheduler = Scheduler::new(10);
        scheduler.register(0u8, lockstep.config().simulation_step_ms);
        lockstep.start(0);

        scheduler.tick(66, 66, |_, ctx| Ok::<_, String>(lockstep.step_simulation(ctx)));
        lockstep.add_pending_command(&Add(7)).unwrap();

        scheduler.tick(99, 99, |_, ctx| Ok::<_, String>(lockstep.step_simulation(ctx)));
        assert!(lockstep.state().applied.is_empty());

        scheduler.tick(33, 33, |_, ctx| Ok::<_, String>(lockstep.step_simulation(ctx)));
        assert_eq!(lockstep.state().applied, vec![(2, 7)]);
    }

    /// Two commands queued within one turn land in consecutive turns.
    #[test]
    fn test_offline_targets_are_strictly_increasing() {
        let mut lockstep = offline();
        lockstep.start(0);

        let first = lockstep.add_pending_command(&Add(1)).unwrap();
        let second = lockstep.add_pending_command(&Add(2)).unwrap();
        assert_eq!(first, Submitted::Scheduled { seq: 1, turn: 1 });
        assert_eq!(second, Submitted::Scheduled { seq: 2, turn: 2 });

        step(&mut lockstep, 6);
        assert_eq!(lockstep.state().applied, vec![(2, 1)]);
        step(&mut lockstep, 6);
        assert_eq!(lockstep.state().applied, vec![(2, 1), (2, 2)]);
    }

    #[test]
    fn test_not_running_applies_completion_immediately() {
        let mut lockstep = offline();
        let result = lockstep
            .add_pending_command_with(&Add(3), |add, player, board| {
                board.applied.push((player, add.0 * 10));
            })
            .unwrap();

        assert_eq!(result, Submitted::Immediate);
        assert_eq!(lockstep.state().applied, vec![(2, 30)]);
        assert_eq!(lockstep.pending_count(), 0);
    }

    #[test]
    fn test_completion_runs_after_logic() {
        let mut lockstep = offline();
        lockstep.start(0);
        lockstep
            .add_pending_command_with(&Add(4), |_, _, board| board.total *= 100)
            .unwrap();

        step(&mut lockstep, 6);
        assert_eq!(lockstep.state().total, 400);
    }

    #[test]
    fn test_simulation_hook_runs_every_tick() {
        let mut lockstep = offline();
        lockstep.set_simulation(|tick, board| board.total = tick as i32);
        lockstep.start(0);

        step(&mut lockstep, 4);
        assert_eq!(lockstep.state().total, 4);
    }

    #[test]
    fn test_unregistered_command_refused() {
        #[derive(Debug)]
        struct Unknown;
        impl CommandPayload for Unknown {
            const TYPE_ID: CommandTypeId = 99;
            const NAME: &'static str = "unknown";
            fn encode_payload(&self) -> Vec<u8> {
                Vec::new()
            }
            fn decode_payload(_: &[u8]) -> Result<Self, PayloadError> {
                Ok(Self)
            }
        }

        let mut lockstep = offline();
        assert_eq!(
            lockstep.add_pending_command(&Unknown),
            Err(SubmitError::Unregistered(99))
        );
    }

    // ------------------------------------------------------------------------
    // Confirmed Turns
    // ------------------------------------------------------------------------

    #[test]
    fn test_blocks_on_unconfirmed_turn() {
        let mut lockstep = authority();
        lockstep.start(0);

        let outcomes = step(&mut lockstep, 6);
        assert_eq!(outcomes[..5], [StepOutcome::Advanced; 5]);
        assert_eq!(outcomes[5], StepOutcome::Blocked);
        assert_eq!(lockstep.sim_tick(), 5);

        assert!(lockstep.confirm_turn(turn_of(1, &[(0, 1)])));
        assert_eq!(step(&mut lockstep, 1), vec![StepOutcome::Advanced]);
        assert_eq!(lockstep.current_turn(), 1);
        assert_eq!(lockstep.state().applied, vec![(0, 1)]);
    }

    #[test]
    fn test_stall_is_reported_once_with_duration() {
        let mut lockstep = authority();
        lockstep.start(0);
        step(&mut lockstep, 5);

        let ctx = TickContext {
            fixed_delta_ms: 33,
            real_delta_ms: 40,
            elapsed_ms: 0,
            step: 6,
        };
        assert_eq!(lockstep.step_simulation(&ctx), StepOutcome::Blocked);
        assert_eq!(lockstep.step_simulation(&ctx), StepOutcome::Blocked);

        lockstep.confirm_turn(ClosedTurn::empty(1));
        assert_eq!(lockstep.step_simulation(&ctx), StepOutcome::Advanced);

        let events = lockstep.drain_events();
        let stalls: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, LockstepEvent::Stalled { .. } | LockstepEvent::Resumed { .. }))
            .collect();
        assert_eq!(
            stalls,
            vec![
                &LockstepEvent::Stalled { turn: 1 },
                &LockstepEvent::Resumed {
                    turn: 1,
                    stalled_ms: 80
                }
            ]
        );
        assert_eq!(lockstep.stats().stalls, 1);
    }

    /// Turns confirmed out of order still execute in turn order, and each
    /// turn's commands run in player order.
    #[test]
    fn test_turns_execute_in_order() {
        let mut lockstep = authority();
        lockstep.start(0);

        lockstep.confirm_turn(turn_of(2, &[(1, 20), (0, 21)]));
        lockstep.confirm_turn(turn_of(1, &[(2, 10), (0, 11), (1, 12)]));
        assert_eq!(lockstep.confirmed_through(), 2);

        step(&mut lockstep, 12);
        assert_eq!(
            lockstep.state().applied,
            vec![(0, 11), (1, 12), (2, 10), (0, 21), (1, 20)]
        );
    }

    #[test]
    fn test_duplicate_turns_apply_once() {
        let mut lockstep = authority();
        lockstep.start(0);

        assert!(lockstep.confirm_turn(turn_of(1, &[(0, 5)])));
        assert!(!lockstep.confirm_turn(turn_of(1, &[(0, 5)])));
        step(&mut lockstep, 6);
        assert!(!lockstep.confirm_turn(turn_of(1, &[(0, 5)])));
        assert_eq!(lockstep.confirm_empty_turns(1, 3), 2);

        step(&mut lockstep, 12);
        assert_eq!(lockstep.state().applied, vec![(0, 5)]);
        assert_eq!(lockstep.current_turn(), 3);
    }

    #[test]
    fn test_failed_command_does_not_abort_turn() {
        let mut lockstep = authority();
        lockstep.start(0);
        lockstep.confirm_turn(
            ClosedTurn::new(
                1,
                vec![
                    Command::from_payload(0, &Add(-1)),
                    Command::new(77, 1, vec![]),
                    Command::from_payload(2, &Add(3)),
                ],
            )
            .unwrap(),
        );

        step(&mut lockstep, 6);
        assert_eq!(lockstep.state().applied, vec![(2, 3)]);

        let failures: Vec<_> = lockstep
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                LockstepEvent::CommandFailed { player, error, .. } => Some((player, error)),
                _ => None,
            })
            .collect();
        assert_eq!(
            failures,
            vec![
                (0, CommandError::rejected("negative")),
                (1, CommandError::Unregistered { type_id: 77 }),
            ]
        );
        assert_eq!(lockstep.stats().failed_commands, 2);
    }

    /// The same closed turn fed to two nodes with different logic only runs
    /// each node's own handlers.
    #[test]
    fn test_roles_keep_separate_logic() {
        let mut server = Lockstep::authority(LockstepConfig::default(), Board::default()).unwrap();
        server.register_command_logic::<Add, _>(|add, player, board| {
            board.applied.push((player, add.0 * 2));
            Ok(())
        });

        let mut client = participant(1);

        server.start(0);
        client.start(0);
        server.confirm_turn(turn_of(1, &[(1, 4)]));
        client.confirm_turn(turn_of(1, &[(1, 4)]));
        step(&mut server, 6);
        step(&mut client, 6);

        assert_eq!(server.state().applied, vec![(1, 8)]);
        assert_eq!(client.state().applied, vec![(1, 4)]);
        assert_eq!(server.digest(), client.digest());
    }

    #[test]
    fn test_authority_has_no_local_commands() {
        let mut lockstep = authority();
        lockstep.start(0);
        assert_eq!(
            lockstep.add_pending_command(&Add(1)),
            Err(SubmitError::NoPlayerNumber)
        );
    }

    // ------------------------------------------------------------------------
    // Participant
    // ------------------------------------------------------------------------

    #[test]
    fn test_participant_heartbeats_fill_horizon() {
        let mut lockstep = participant(0);
        lockstep.start(0);
        assert_eq!(
            lockstep.drain_outbox(),
            vec![Submission::heartbeat(1), Submission::heartbeat(2)]
        );

        lockstep.confirm_turn(ClosedTurn::empty(1));
        step(&mut lockstep, 6);
        assert_eq!(lockstep.drain_outbox(), vec![Submission::heartbeat(3)]);
    }

    #[test]
    fn test_participant_command_goes_to_outbox() {
        let mut lockstep = participant(3);
        lockstep.start(0);
        lockstep.drain_outbox();

        let submitted = lockstep.add_pending_command(&Add(9)).unwrap();
        assert_eq!(submitted, Submitted::Scheduled { seq: 1, turn: 2 });
        assert_eq!(
            lockstep.drain_outbox(),
            vec![Submission::command(2, 1, Command::from_payload(3, &Add(9)))]
        );

        // Not applied locally until the server confirms it.
        lockstep.confirm_turn(ClosedTurn::empty(1));
        step(&mut lockstep, 6);
        assert!(lockstep.state().applied.is_empty());
        assert_eq!(lockstep.drain_outbox(), vec![Submission::heartbeat(3)]);
    }

    #[test]
    fn test_participant_completion_runs_when_turn_lands() {
        let mut lockstep = participant(1);
        lockstep.start(0);

        let hits = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&hits);
        lockstep
            .add_pending_command_with(&Add(6), move |add, player, _| {
                seen.borrow_mut().push((player, add.0));
            })
            .unwrap();

        lockstep.confirm_turn(ClosedTurn::empty(1));
        lockstep.confirm_turn(turn_of(2, &[(0, 1), (1, 6)]));
        step(&mut lockstep, 12);

        assert_eq!(*hits.borrow(), vec![(1, 6)]);
        assert_eq!(lockstep.pending_count(), 0);
        assert_eq!(lockstep.state().applied, vec![(0, 1), (1, 6)]);
    }

    #[test]
    fn test_missed_turn_resubmits_with_new_seq() {
        let mut lockstep = participant(0);
        lockstep.start(0);
        lockstep.add_pending_command(&Add(1)).unwrap();
        lockstep.drain_outbox();

        lockstep.confirm_turn(ClosedTurn::empty(1));
        lockstep.confirm_turn(ClosedTurn::empty(2));
        step(&mut lockstep, 12);

        let outbox = lockstep.drain_outbox();
        let resubmitted: Vec<_> = outbox.iter().filter(|s| !s.is_heartbeat()).collect();
        assert_eq!(resubmitted.len(), 1);
        assert_eq!(resubmitted[0].seq, 2);
        assert_eq!(resubmitted[0].turn, 4);
        assert_eq!(lockstep.stats().resubmitted_commands, 1);
    }

    #[test]
    fn test_retries_exhaust_into_discard() {
        let mut config = LockstepConfig::default();
        config.max_retries = 1;
        let mut lockstep = Lockstep::participant(config, Board::default()).unwrap();
        lockstep.set_player_number(0).unwrap();
        lockstep.register_command::<Add>();
        lockstep.start(0);

        let Submitted::Scheduled { seq, .. } = lockstep.add_pending_command(&Add(1)).unwrap() else {
            panic!("expected a scheduled command");
        };
        assert!(lockstep.on_command_rejected(seq, Rejection::TooLate, 2));
        assert!(lockstep.on_command_rejected(seq + 1, Rejection::TooLate, 3));
        assert!(!lockstep.on_command_rejected(seq + 1, Rejection::TooLate, 3));

        assert_eq!(lockstep.pending_count(), 0);
        assert!(lockstep.drain_events().contains(&LockstepEvent::CommandDiscarded {
            seq: seq + 1,
            type_id: Add::TYPE_ID
        }));
    }

    #[test]
    fn test_too_early_lowers_lead() {
        let mut config = LockstepConfig::default();
        config.execution_turn_anticipation = 3;
        let mut lockstep = Lockstep::participant(config, Board::default()).unwrap();
        lockstep.set_player_number(0).unwrap();
        lockstep.register_command::<Add>();
        lockstep.start(0);
        lockstep.drain_outbox();

        let Submitted::Scheduled { seq, turn } = lockstep.add_pending_command(&Add(1)).unwrap() else {
            panic!("expected a scheduled command");
        };
        assert_eq!(turn, 3);
        lockstep.on_command_rejected(seq, Rejection::TooEarly, 0);
        assert_eq!(lockstep.execution_anticipation(), 2);

        let resent = lockstep.drain_outbox();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].turn, 4);
    }

    #[test]
    fn test_participant_bounds_turns_held_ahead() {
        let mut lockstep = participant(0);
        lockstep.start(0);
        assert_eq!(lockstep.confirm_horizon(), 70);

        assert_eq!(lockstep.confirm_empty_turns(1, u32::MAX), 70);
        assert_eq!(lockstep.confirmed_through(), 70);
        assert!(!lockstep.confirm_turn(ClosedTurn::empty(71)));

        step(&mut lockstep, 6);
        assert_eq!(lockstep.confirm_horizon(), 71);
        assert!(lockstep.confirm_turn(ClosedTurn::empty(71)));
    }

    #[test]
    fn test_authority_takes_any_turn() {
        let mut lockstep = authority();
        lockstep.start(0);
        assert!(lockstep.confirm_turn(ClosedTurn::empty(1_000)));
    }

    /// A command pushed off its turn leaves a heartbeat behind, so the server
    /// does not wait out the retry budget on that turn.
    #[test]
    fn test_too_early_leaves_heartbeat_on_vacated_turn() {
        let mut lockstep = participant(0);
        lockstep.start(0);
        lockstep.add_pending_command(&Add(1)).unwrap();
        let Submitted::Scheduled { seq, turn } = lockstep.add_pending_command(&Add(2)).unwrap() else {
            panic!("expected a scheduled command");
        };
        assert_eq!(turn, 3);

        lockstep.confirm_turn(ClosedTurn::empty(1));
        step(&mut lockstep, 6);
        assert!(lockstep.on_command_rejected(seq, Rejection::TooEarly, 0));

        lockstep.confirm_turn(turn_of(2, &[(0, 1)]));
        step(&mut lockstep, 6);

        let outbox = lockstep.drain_outbox();
        let for_turn_3: Vec<_> = outbox
            .iter()
            .filter(|s| s.turn == 3 && s.seq != seq)
            .collect();
        assert_eq!(for_turn_3, vec![&Submission::heartbeat(3)]);
        assert!(
            outbox
                .iter()
                .any(|s| s.turn == 4 && !s.is_heartbeat()),
            "command moved to turn 4"
        );
    }

    /// Late rejections vacate closed turns; nothing is re-sent for them.
    #[test]
    fn test_too_late_sends_no_heartbeat_for_closed_turn() {
        let mut lockstep = participant(0);
        lockstep.start(0);
        let Submitted::Scheduled { seq, .. } = lockstep.add_pending_command(&Add(1)).unwrap() else {
            panic!("expected a scheduled command");
        };
        lockstep.drain_outbox();

        lockstep.on_command_rejected(seq, Rejection::TooLate, 2);
        lockstep.confirm_turn(ClosedTurn::empty(1));
        step(&mut lockstep, 6);

        assert!(lockstep.drain_outbox().iter().all(|s| s.turn != 2));
    }

    #[test]
    fn test_player_number_fixed_while_running() {
        let mut lockstep = participant(1);
        lockstep.start(0);
        assert_eq!(lockstep.set_player_number(1), Ok(()));
        assert_eq!(
            lockstep.set_player_number(2),
            Err(LockstepError::PlayerNumberFixed(1))
        );
        assert_eq!(
            lockstep.set_config(LockstepConfig::default()),
            Err(LockstepError::AlreadyRunning)
        );

        lockstep.stop();
        assert!(lockstep.set_player_number(2).is_ok());
    }

    /// Restarting past a pending command's target moves it forward.
    #[test]
    fn test_restart_resubmits_stale_commands() {
        let mut lockstep = participant(0);
        lockstep.start(0);
        lockstep.add_pending_command(&Add(1)).unwrap();
        lockstep.drain_outbox();

        lockstep.start(5);
        let commands: Vec<_> = lockstep
            .drain_outbox()
            .into_iter()
            .filter(|s| !s.is_heartbeat())
            .collect();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].turn, 7);
        assert_eq!(lockstep.sim_tick(), 30);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    fn turns_and_order() -> impl Strategy<Value = (Vec<Vec<PlayerNumber>>, Vec<Turn>)> {
        prop::collection::vec(prop::collection::btree_set(0u8..6, 0..4), 1..8).prop_flat_map(
            |turns| {
                let turns: Vec<Vec<PlayerNumber>> =
                    turns.into_iter().map(|set| set.into_iter().collect()).collect();
                let order: Vec<Turn> = (1..=turns.len() as Turn).collect();
                (Just(turns), Just(order).prop_shuffle())
            },
        )
    }

    proptest! {
        /// Whatever order turns are confirmed in, execution follows turn
        /// order and player order inside each turn.
        #[test]
        fn prop_execution_order_is_canonical((turns, order) in turns_and_order()) {
            let mut lockstep = authority();
            lockstep.start(0);

            for turn in &order {
                let players = &turns[(*turn - 1) as usize];
                let commands: Vec<_> = players
                    .iter()
                    .rev()
                    .map(|p| (*p, (*turn as i32) * 10 + i32::from(*p)))
                    .collect();
                lockstep.confirm_turn(turn_of(*turn, &commands));
            }

            step(&mut lockstep, turns.len() as u32 * 6);

            let expected: Vec<_> = turns
                .iter()
                .enumerate()
                .flat_map(|(index, players)| {
                    let turn = index as i32 + 1;
                    players.iter().map(move |p| (*p, turn * 10 + i32::from(*p)))
                })
                .collect();
            prop_assert_eq!(&lockstep.state().applied, &expected);
            prop_assert_eq!(lockstep.current_turn(), turns.len() as Turn);
        }
    }
}
