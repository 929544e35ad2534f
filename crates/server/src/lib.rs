//! Lockstep Server
//!
//! The server network controller sits between the host transport and the
//! authoritative lockstep. It owns:
//! - the participant set and player number assignment
//! - the [`TurnBuffer`] that admits submissions and closes turns
//! - the authoritative [`Lockstep`] executing every closed turn
//! - an optional co-resident local client fed without serialization
//! - replay recording
//!
//! # Clock
//!
//! One [`Scheduler`] drives three listeners, always in this order:
//!
//! 1. [`ServerClock::TurnClosing`] every command step: close due turns, hand
//!    them to the authority and the local client, fan them out, retire.
//! 2. [`ServerClock::Simulation`] every simulation step: advance the
//!    authority.
//! 3. [`ServerClock::LocalSimulation`] every simulation step: advance the
//!    local client and feed its submissions to the buffer.
//!
//! # Match Flow
//!
//! ```text
//! client                         server
//!   ── PlayerReady ──────────────►  join (or rejoin)
//!   ◄──────────────── ClientSetup    player number + config
//!   ◄────────── ParticipantStatus    to every participant
//!   ◄──────────────── ClientStart    once PlayersCount are ready
//!   ── SubmitCommand ────────────►  turn buffer
//!   ◄──────── Turn / EmptyTurns      every command step
//!   ── TurnAck ──────────────────►  retirement
//! ```

#![deny(unsafe_code)]

pub mod participant;
pub mod turn_buffer;
pub mod window;

use lockstep_replay::{ReplayError, ReplayRecorder};
use lockstep_sim::{
    CommandError, CommandSeq, CommandTypeId, ConfigError, Lockstep, LockstepConfig,
    LockstepError, LockstepEvent, PlayerNumber, Rejection, Scheduler, StepOutcome, Submission,
    TickContext, TickReport, Turn,
};
use lockstep_wire::transport::{
    ClientId, Mailbox, MailboxPoster, RawMessage, Recipient, Transport, TransportEvent,
};
use lockstep_wire::{
    ClientSetupProto, ClientStartProto, CommandRejectedProto, EmptyTurnsProto,
    ParticipantStatusProto, PlayerReadyProto, ReplayArtifact, ServerErrorProto,
    SubmitCommandProto, TurnAckProto, TurnProto, WireError, decode, error_code, msg_type,
};
use prost::Message;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use participant::{JoinError, Joined, Participant, ParticipantArena};
pub use turn_buffer::{BufferConfig, TurnBuffer, TurnPhase};
pub use window::{Admission, check_window};

// ============================================================================
// Public Types
// ============================================================================

/// Periodic listeners of the server, in firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerClock {
    TurnClosing,
    Simulation,
    LocalSimulation,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("the match has already started")]
    AlreadyStarted,

    #[error("a local client is already registered")]
    LocalClientExists,

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lockstep(#[from] LockstepError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// Things the host may want to react to, drained with
/// [`ServerController::drain_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ParticipantJoined {
        player: PlayerNumber,
        player_id: String,
        rejoined: bool,
    },
    ParticipantLeft {
        player: PlayerNumber,
    },
    JoinRefused {
        client: ClientId,
        reason: JoinError,
    },
    MatchStarted {
        start_turn: Turn,
    },
    TurnClosed {
        turn: Turn,
        commands: usize,
    },
    CommandRejected {
        player: PlayerNumber,
        turn: Turn,
        seq: CommandSeq,
        rejection: Rejection,
    },
    MalformedMessage {
        client: ClientId,
        msg_type: u8,
        reason: String,
    },
    /// A command failed on the authoritative execution path.
    CommandFailed {
        turn: Turn,
        player: PlayerNumber,
        type_id: CommandTypeId,
        error: CommandError,
    },
}

struct LocalClient<S> {
    player: PlayerNumber,
    lockstep: Lockstep<S>,
}

// ============================================================================
// Server Controller
// ============================================================================

/// Server side of a lockstep session.
///
/// The host hands every transport event to [`handle_event`], or posts it
/// through [`mailbox`] from another thread, and calls [`tick`] from its
/// timer with the elapsed fixed and real time. Posted events are handled at
/// the start of the next tick.
///
/// [`handle_event`]: ServerController::handle_event
/// [`mailbox`]: ServerController::mailbox
/// [`tick`]: ServerController::tick
pub struct ServerController<S, T> {
    scheduler: Scheduler<ServerClock>,
    mailbox: Mailbox,
    core: ServerCore<S, T>,
}

struct ServerCore<S, T> {
    config: LockstepConfig,
    transport: T,
    buffer: TurnBuffer,
    authority: Lockstep<S>,
    local: Option<LocalClient<S>>,
    running: bool,
    /// Start delay of clocks still to be registered.
    pending_start: Option<u32>,
    record_replay: bool,
    recorder: Option<ReplayRecorder>,
    events: Vec<ServerEvent>,
}

impl<S, T: Transport> ServerController<S, T> {
    /// Create a server whose authoritative simulation starts from `state`.
    pub fn new(config: LockstepConfig, state: S, transport: T) -> Result<Self, ServerError> {
        let authority = Lockstep::authority(config.clone(), state)?;
        Ok(Self {
            scheduler: Scheduler::new(config.max_simulation_steps_per_tick),
            mailbox: Mailbox::new(),
            core: ServerCore {
                buffer: TurnBuffer::new(BufferConfig::from(&config)),
                config,
                transport,
                authority,
                local: None,
                running: false,
                pending_start: None,
                record_replay: false,
                recorder: None,
                events: Vec::new(),
            },
        })
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.core.config
    }

    /// The authoritative lockstep. Register server-side command logic here.
    pub fn authority(&self) -> &Lockstep<S> {
        &self.core.authority
    }

    pub fn authority_mut(&mut self) -> &mut Lockstep<S> {
        &mut self.core.authority
    }

    /// Host a client in this process. It joins like a remote one and counts
    /// towards `players_count`, but its traffic never touches the transport.
    pub fn register_local_client(
        &mut self,
        player_id: &str,
        state: S,
    ) -> Result<PlayerNumber, ServerError> {
        if self.core.running {
            return Err(ServerError::AlreadyStarted);
        }
        if self.core.local.is_some() {
            return Err(ServerError::LocalClientExists);
        }

        let mut lockstep = Lockstep::participant(self.core.config.clone(), state)?;
        let joined = self.core.buffer.join(player_id, None)?;
        let player = joined.player();
        lockstep.set_player_number(player)?;
        self.core.local = Some(LocalClient { player, lockstep });

        self.core.on_joined(joined, player_id);
        self.core.maybe_start();
        self.register_pending_clocks();
        Ok(player)
    }

    /// The co-resident client's lockstep. Register its command logic and
    /// queue its commands here.
    pub fn local(&self) -> Option<&Lockstep<S>> {
        self.core.local.as_ref().map(|l| &l.lockstep)
    }

    pub fn local_mut(&mut self) -> Option<&mut Lockstep<S>> {
        self.core.local.as_mut().map(|l| &mut l.lockstep)
    }

    /// Record executed turns from the match start on.
    pub fn enable_replay(&mut self) -> Result<(), ServerError> {
        if self.core.running {
            return Err(ServerError::AlreadyStarted);
        }
        self.core.record_replay = true;
        Ok(())
    }

    /// Stop recording and return the artifact covering every turn executed
    /// so far.
    pub fn finish_replay(&mut self) -> Option<ReplayArtifact> {
        self.core.recorder.take().map(ReplayRecorder::finalize)
    }

    /// [`finish_replay`](Self::finish_replay), anchored on the authoritative
    /// state as hashed by `state_digest`.
    pub fn finish_replay_with_state<F>(&mut self, state_digest: F) -> Option<ReplayArtifact>
    where
        F: Fn(&S) -> u64,
    {
        let digest = state_digest(self.core.authority.state());
        self.core
            .recorder
            .take()
            .map(|recorder| recorder.finalize_with_state_digest(digest))
    }

    // ------------------------------------------------------------------------
    // Host Entry Points
    // ------------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(client) => trace!(client, "client connected"),
            TransportEvent::Disconnected(client) => self.core.on_disconnected(client),
            TransportEvent::Message(message) => self.core.on_message(message),
        }
        self.register_pending_clocks();
    }

    /// Handle for queueing transport events from outside the host loop.
    pub fn mailbox(&self) -> MailboxPoster {
        self.mailbox.poster()
    }

    /// Handle posted events, then advance the server clock.
    pub fn tick(&mut self, fixed_delta_ms: u32, real_delta_ms: u32) -> TickReport<ServerClock> {
        for event in self.mailbox.drain() {
            self.handle_event(event);
        }
        let core = &mut self.core;
        self.scheduler
            .tick(fixed_delta_ms, real_delta_ms, |clock, ctx| core.on_clock(clock, ctx))
    }

    /// Stop every clock and lockstep. Participants stay connected.
    pub fn stop(&mut self) {
        for clock in [
            ServerClock::TurnClosing,
            ServerClock::Simulation,
            ServerClock::LocalSimulation,
        ] {
            self.scheduler.unregister(clock);
        }
        self.core.authority.stop();
        if let Some(local) = self.core.local.as_mut() {
            local.lockstep.stop();
        }
        self.core.running = false;
        info!(turn = self.core.authority.current_turn(), "server stopped");
    }

    fn register_pending_clocks(&mut self) {
        let Some(delay) = self.core.pending_start.take() else {
            return;
        };
        let simulation_step = self.core.config.simulation_step_ms;
        self.scheduler.register_delayed(
            ServerClock::TurnClosing,
            self.core.config.command_step_ms(),
            delay,
        );
        self.scheduler
            .register_delayed(ServerClock::Simulation, simulation_step, delay);
        if self.core.local.is_some() {
            self.scheduler
                .register_delayed(ServerClock::LocalSimulation, simulation_step, delay);
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.core.events)
    }

    pub fn buffer(&self) -> &TurnBuffer {
        &self.core.buffer
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.core.transport
    }

    pub fn scheduler(&self) -> &Scheduler<ServerClock> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.core.running
    }

    pub fn last_closed_turn(&self) -> Turn {
        self.core.buffer.last_closed()
    }

    /// Player number of a connected remote client.
    pub fn player_of(&self, client: ClientId) -> Option<PlayerNumber> {
        self.core.player_of(client)
    }
}

// ============================================================================
// Message Handling
// ============================================================================

impl<S, T: Transport> ServerCore<S, T> {
    fn player_of(&self, client: ClientId) -> Option<PlayerNumber> {
        self.buffer.participants().by_client(client).map(|p| p.player)
    }

    fn on_message(&mut self, message: RawMessage) {
        let RawMessage {
            from,
            msg_type: kind,
            payload,
        } = message;

        let result = match kind {
            msg_type::PLAYER_READY => {
                decode::<PlayerReadyProto>(&payload).map(|ready| self.on_player_ready(from, ready))
            }
            msg_type::SUBMIT_COMMAND => decode::<SubmitCommandProto>(&payload)
                .and_then(Submission::try_from)
                .map(|submission| self.on_submission(from, submission)),
            msg_type::TURN_ACK => {
                decode::<TurnAckProto>(&payload).map(|ack| self.on_turn_ack(from, ack.turn))
            }
            other => Err(WireError::UnknownMessageType(other)),
        };

        if let Err(err) = result {
            self.report_malformed(from, kind, &err.to_string());
        }
    }

    fn report_malformed(&mut self, client: ClientId, kind: u8, reason: &str) {
        warn!(
            client,
            msg_type = msg_type::name(kind).unwrap_or("unknown"),
            reason,
            "dropping malformed message"
        );
        self.transport.send_message(
            Recipient::One(client),
            msg_type::SERVER_ERROR,
            &ServerErrorProto {
                code: error_code::MALFORMED_MESSAGE,
                message: reason.to_string(),
                turn: 0,
            },
        );
        self.events.push(ServerEvent::MalformedMessage {
            client,
            msg_type: kind,
            reason: reason.to_string(),
        });
    }

    fn on_player_ready(&mut self, client: ClientId, ready: PlayerReadyProto) {
        let joined = match self.buffer.join(&ready.player_id, Some(client)) {
            Ok(joined) => joined,
            Err(reason) => {
                warn!(client, player_id = %ready.player_id, %reason, "join refused");
                let code = match reason {
                    JoinError::MatchFull { .. } => error_code::MATCH_FULL,
                    JoinError::AlreadyConnected { .. } => error_code::PLAYER_ID_IN_USE,
                };
                self.transport.send_message(
                    Recipient::One(client),
                    msg_type::SERVER_ERROR,
                    &ServerErrorProto {
                        code,
                        message: reason.to_string(),
                        turn: 0,
                    },
                );
                self.events.push(ServerEvent::JoinRefused { client, reason });
                return;
            }
        };

        let player = joined.player();
        self.transport.send_message(
            Recipient::One(client),
            msg_type::CLIENT_SETUP,
            &ClientSetupProto::new(player, &self.config),
        );
        self.on_joined(joined, &ready.player_id);

        if self.running {
            self.catch_up(client, joined, ready.current_turn);
        } else {
            self.maybe_start();
        }
    }

    fn on_joined(&mut self, joined: Joined, player_id: &str) {
        let player = joined.player();
        info!(player, player_id, rejoined = matches!(joined, Joined::Rejoined(_)), "participant joined");
        self.broadcast(
            msg_type::PARTICIPANT_STATUS,
            &ParticipantStatusProto {
                player_number: u32::from(player),
                connected: true,
            },
        );
        self.events.push(ServerEvent::ParticipantJoined {
            player,
            player_id: player_id.to_string(),
            rejoined: matches!(joined, Joined::Rejoined(_)),
        });
    }

    fn on_disconnected(&mut self, client: ClientId) {
        let Some(player) = self.player_of(client) else {
            trace!(client, "unjoined client disconnected");
            return;
        };
        self.buffer.disconnect(player);
        info!(player, client, "participant left");
        self.broadcast(
            msg_type::PARTICIPANT_STATUS,
            &ParticipantStatusProto {
                player_number: u32::from(player),
                connected: false,
            },
        );
        self.events.push(ServerEvent::ParticipantLeft { player });
    }

    fn on_submission(&mut self, client: ClientId, submission: Submission) {
        let Some(player) = self.player_of(client) else {
            debug!(client, "submission from a client that has not joined");
            return;
        };

        // The issuer is whoever sent it, whatever the payload claims.
        let Submission { turn, seq, command } = submission;
        let command = command.map(|c| c.with_player(player));
        if let Some(command) = &command
            && let Err(err) = self.authority.registry().factory().materialize(command)
        {
            self.report_malformed(client, msg_type::SUBMIT_COMMAND, &err.to_string());
            return;
        }

        let is_heartbeat = command.is_none();
        let admission = self.buffer.submit(player, Submission { turn, seq, command });
        let Some(rejection) = admission.rejection() else {
            return;
        };
        if is_heartbeat {
            trace!(player, turn, reason = rejection.as_str(), "heartbeat outside window");
            return;
        }

        let last_closed = self.buffer.last_closed();
        debug!(player, turn, seq, reason = rejection.as_str(), last_closed, "submission rejected");
        self.transport.send_message(
            Recipient::One(client),
            msg_type::COMMAND_REJECTED,
            &CommandRejectedProto::new(turn, seq, rejection, last_closed),
        );
        self.events.push(ServerEvent::CommandRejected {
            player,
            turn,
            seq,
            rejection,
        });
    }

    fn on_turn_ack(&mut self, client: ClientId, turn: Turn) {
        if let Some(player) = self.player_of(client) {
            self.buffer.acknowledge(player, turn);
        }
    }

    // ------------------------------------------------------------------------
    // Match Lifecycle
    // ------------------------------------------------------------------------

    fn maybe_start(&mut self) {
        if self.running
            || self.buffer.participants().connected_count() < usize::from(self.config.players_count)
        {
            return;
        }

        let start_turn = self.buffer.last_closed();
        let player_ids = self.buffer.participants().player_ids();
        self.buffer.start(start_turn);
        self.authority.start(start_turn);
        if let Some(local) = self.local.as_mut() {
            local.lockstep.start(start_turn);
        }
        if self.record_replay {
            self.recorder = Some(ReplayRecorder::new(
                self.config.clone(),
                start_turn,
                player_ids.clone(),
            ));
        }
        self.flush_local();

        self.broadcast(
            msg_type::CLIENT_START,
            &ClientStartProto {
                start_turn,
                start_delay_ms: self.config.start_delay_ms,
                player_ids,
            },
        );
        for participant in self.buffer.participants_mut().iter_mut() {
            participant.delivered = start_turn;
            participant.acked = start_turn;
        }

        self.running = true;
        self.pending_start = Some(self.config.start_delay_ms);
        info!(start_turn, players = self.config.players_count, "match started");
        self.events.push(ServerEvent::MatchStarted { start_turn });
    }

    /// Bring a participant joining a running match up to date.
    ///
    /// A rejoining client whose reported turn is still covered by retained
    /// turns resumes from there; anyone else starts at the last closed turn.
    fn catch_up(&mut self, client: ClientId, joined: Joined, reported: Turn) {
        let last_closed = self.buffer.last_closed();
        let from = match joined {
            Joined::Rejoined(_) if self.buffer.can_resend_from(reported) => reported,
            _ => last_closed,
        };

        self.transport.send_message(
            Recipient::One(client),
            msg_type::CLIENT_START,
            &ClientStartProto {
                start_turn: from,
                start_delay_ms: 0,
                player_ids: self.buffer.participants().player_ids(),
            },
        );
        if let Some(participant) = self.buffer.participants_mut().get_mut(joined.player()) {
            participant.delivered = from;
            participant.acked = from;
        }
        self.send_turns(client, from + 1, last_closed);
        if let Some(participant) = self.buffer.participants_mut().get_mut(joined.player()) {
            participant.delivered = last_closed;
        }
        debug!(player = joined.player(), from, last_closed, "participant caught up");
    }

    // ------------------------------------------------------------------------
    // Clock Handlers
    // ------------------------------------------------------------------------

    fn on_clock(&mut self, clock: ServerClock, ctx: &TickContext) -> Result<StepOutcome, ServerError> {
        match clock {
            ServerClock::TurnClosing => Ok(self.close_turns()),
            ServerClock::Simulation => self.step_authority(ctx),
            ServerClock::LocalSimulation => Ok(self.step_local(ctx)),
        }
    }

    fn close_turns(&mut self) -> StepOutcome {
        self.flush_local();

        for turn in self.buffer.advance() {
            self.events.push(ServerEvent::TurnClosed {
                turn: turn.turn(),
                commands: turn.len(),
            });
            if let Some(local) = self.local.as_mut() {
                local.lockstep.confirm_turn(turn.clone());
            }
            self.authority.confirm_turn(turn);
        }
        self.acknowledge_local();
        self.fan_out();
        self.buffer.retire();
        StepOutcome::Advanced
    }

    fn step_authority(&mut self, ctx: &TickContext) -> Result<StepOutcome, ServerError> {
        let outcome = self.authority.step_simulation(ctx);
        if outcome == StepOutcome::Advanced {
            self.buffer.mark_executed(self.authority.current_turn());
        }

        // Every event is handled even if recording fails part way.
        let mut recording = Ok(());
        for event in self.authority.drain_events() {
            if let LockstepEvent::CommandFailed {
                turn,
                player,
                type_id,
                error,
            } = &event
            {
                self.broadcast(
                    msg_type::SERVER_ERROR,
                    &ServerErrorProto {
                        code: error_code::COMMAND_FAILED,
                        message: format!("command {type_id} from player {player} failed: {error}"),
                        turn: *turn,
                    },
                );
                self.events.push(ServerEvent::CommandFailed {
                    turn: *turn,
                    player: *player,
                    type_id: *type_id,
                    error: error.clone(),
                });
            }
            if let Some(recorder) = self.recorder.as_mut()
                && let Err(err) = recorder.record_event(&event)
                && recording.is_ok()
            {
                recording = Err(err);
            }
        }
        recording?;
        Ok(outcome)
    }

    fn step_local(&mut self, ctx: &TickContext) -> StepOutcome {
        let outcome = match self.local.as_mut() {
            Some(local) => local.lockstep.step_simulation(ctx),
            None => return StepOutcome::Blocked,
        };
        self.flush_local();
        self.acknowledge_local();
        outcome
    }

    // ------------------------------------------------------------------------
    // Local Client
    // ------------------------------------------------------------------------

    /// Move the local client's submissions straight into the buffer.
    fn flush_local(&mut self) {
        let Some(local) = self.local.as_mut() else {
            return;
        };
        for submission in local.lockstep.drain_outbox() {
            let (turn, seq, is_heartbeat) = (submission.turn, submission.seq, submission.is_heartbeat());
            let admission = self.buffer.submit(local.player, submission);
            if let Some(rejection) = admission.rejection()
                && !is_heartbeat
            {
                debug!(turn, seq, reason = rejection.as_str(), "local submission rejected");
                local
                    .lockstep
                    .on_command_rejected(seq, rejection, self.buffer.last_closed());
            }
        }
    }

    fn acknowledge_local(&mut self) {
        if let Some(local) = self.local.as_ref() {
            self.buffer
                .acknowledge(local.player, local.lockstep.confirmed_through());
        }
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Send every closed turn a remote participant has not received yet.
    fn fan_out(&mut self) {
        let last_closed = self.buffer.last_closed();
        let behind: Vec<(PlayerNumber, ClientId, Turn)> = self
            .buffer
            .participants()
            .connected()
            .filter(|p| p.delivered < last_closed)
            .filter_map(|p| p.client.map(|client| (p.player, client, p.delivered)))
            .collect();

        for (player, client, delivered) in behind {
            self.send_turns(client, delivered + 1, last_closed);
            if let Some(participant) = self.buffer.participants_mut().get_mut(player) {
                participant.delivered = last_closed;
            }
        }
    }

    /// Send turns `first..=last`, batching runs of empty turns.
    fn send_turns(&mut self, client: ClientId, first: Turn, last: Turn) {
        let mut empty_run: Option<(Turn, u32)> = None;

        for turn in first..=last {
            let Some(closed) = self.buffer.closed_turn(turn) else {
                warn!(client, turn, "closed turn no longer retained");
                continue;
            };
            if closed.is_empty() {
                match empty_run.as_mut() {
                    Some((_, count)) => *count += 1,
                    None => empty_run = Some((turn, 1)),
                }
                continue;
            }

            let proto = TurnProto::from(closed);
            if let Some((first_turn, count)) = empty_run.take() {
                send_empty_turns(&mut self.transport, client, first_turn, count);
            }
            self.transport
                .send_message(Recipient::One(client), msg_type::TURN, &proto);
        }

        if let Some((first_turn, count)) = empty_run {
            send_empty_turns(&mut self.transport, client, first_turn, count);
        }
    }

    /// Send to every connected remote participant.
    fn broadcast<M: Message>(&mut self, kind: u8, message: &M) {
        let payload = message.encode_to_vec();
        let clients: Vec<ClientId> = self
            .buffer
            .participants()
            .connected()
            .filter_map(|p| p.client)
            .collect();
        for client in clients {
            self.transport
                .send(Recipient::One(client), kind, payload.clone());
        }
    }
}

fn send_empty_turns<T: Transport>(transport: &mut T, client: ClientId, first_turn: Turn, count: u32) {
    transport.send_message(
        Recipient::One(client),
        msg_type::EMPTY_TURNS,
        &EmptyTurnsProto { first_turn, count },
    );
}

impl<S, T> std::fmt::Debug for ServerController<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerController")
            .field("running", &self.core.running)
            .field("last_closed", &self.core.buffer.last_closed())
            .field("executed", &self.core.authority.current_turn())
            .field("participants", &self.core.buffer.participants().len())
            .field("local", &self.core.local.as_ref().map(|l| l.player))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
