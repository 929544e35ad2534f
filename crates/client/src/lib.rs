//! Lockstep Client
//!
//! The client network controller wraps a participant [`Lockstep`] and speaks
//! the session protocol with the server:
//! - announces itself with `PlayerReady` once connected
//! - takes its player number and config from `ClientSetup`
//! - starts its simulation clock on `ClientStart`, after the start delay
//! - feeds `Turn` / `EmptyTurns` into the lockstep and acknowledges them
//! - sends local submissions (commands and heartbeats) after every event
//!   and every tick
//!
//! Game code registers client-side command logic and queues commands
//! through [`ClientController::lockstep_mut`].

#![deny(unsafe_code)]

use std::convert::Infallible;

use lockstep_sim::{
    ClosedTurn, ConfigError, Lockstep, LockstepConfig, LockstepError, PlayerNumber, Scheduler,
    TickReport, Turn,
};
use lockstep_wire::transport::{
    Mailbox, MailboxPoster, RawMessage, Recipient, Transport, TransportEvent,
};
use lockstep_wire::{
    ClientSetupProto, ClientStartProto, CommandRejectedProto, EmptyTurnsProto,
    ParticipantStatusProto, PlayerReadyProto, ServerErrorProto, SubmitCommandProto,
    TurnAckProto, TurnProto, WireError, decode, msg_type,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Periodic listeners of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientClock {
    Simulation,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("start received before setup")]
    NotSetUp,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lockstep(#[from] LockstepError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SetupReceived {
        player: PlayerNumber,
        config: LockstepConfig,
    },
    Started {
        start_turn: Turn,
        player_ids: Vec<String>,
    },
    ParticipantStatus {
        player: PlayerNumber,
        connected: bool,
    },
    ServerError {
        code: u32,
        message: String,
        turn: Turn,
    },
    MalformedMessage {
        msg_type: u8,
        reason: String,
    },
    Disconnected,
}

/// Client side of a lockstep session.
pub struct ClientController<S, T> {
    scheduler: Scheduler<ClientClock>,
    mailbox: Mailbox,
    core: ClientCore<S, T>,
}

struct ClientCore<S, T> {
    player_id: String,
    transport: T,
    lockstep: Lockstep<S>,
    /// Highest turn acknowledged to the server.
    acked: Turn,
    pending_start: Option<u32>,
    events: Vec<ClientEvent>,
}

impl<S, T: Transport> ClientController<S, T> {
    /// Create a client identified by `player_id` across reconnects.
    ///
    /// The default config only applies until the server's setup arrives.
    pub fn new(player_id: impl Into<String>, state: S, transport: T) -> Result<Self, ClientError> {
        let config = LockstepConfig::default();
        Ok(Self {
            scheduler: Scheduler::new(config.max_simulation_steps_per_tick),
            mailbox: Mailbox::new(),
            core: ClientCore {
                player_id: player_id.into(),
                transport,
                lockstep: Lockstep::participant(config, state)?,
                acked: 0,
                pending_start: None,
                events: Vec::new(),
            },
        })
    }

    pub fn lockstep(&self) -> &Lockstep<S> {
        &self.core.lockstep
    }

    pub fn lockstep_mut(&mut self) -> &mut Lockstep<S> {
        &mut self.core.lockstep
    }

    pub fn player_id(&self) -> &str {
        &self.core.player_id
    }

    pub fn player_number(&self) -> Option<PlayerNumber> {
        self.core.lockstep.player_number()
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(_) => self.core.announce(),
            TransportEvent::Disconnected(_) => {
                self.scheduler.unregister(ClientClock::Simulation);
                self.core.lockstep.stop();
                self.core.pending_start = None;
                info!(turn = self.core.lockstep.current_turn(), "disconnected from server");
                self.core.events.push(ClientEvent::Disconnected);
            }
            TransportEvent::Message(message) => self.core.on_message(message),
        }

        if let Some(delay) = self.core.pending_start.take() {
            let step = self.core.lockstep.config().simulation_step_ms;
            self.scheduler = Scheduler::new(self.core.lockstep.config().max_simulation_steps_per_tick);
            self.scheduler
                .register_delayed(ClientClock::Simulation, step, delay);
        }
        self.core.flush();
    }

    /// Queue transport events from the receiving thread. They are handled
    /// at the start of the next [`tick`](Self::tick).
    pub fn mailbox(&self) -> MailboxPoster {
        self.mailbox.poster()
    }

    /// Handle posted events, advance the client clock and send whatever the
    /// simulation produced.
    pub fn tick(&mut self, fixed_delta_ms: u32, real_delta_ms: u32) -> TickReport<ClientClock> {
        for event in self.mailbox.drain() {
            self.handle_event(event);
        }
        let lockstep = &mut self.core.lockstep;
        let report = self
            .scheduler
            .tick(fixed_delta_ms, real_delta_ms, |_, ctx| {
                Ok::<_, Infallible>(lockstep.step_simulation(ctx))
            });
        self.core.flush();
        report
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.core.events)
    }

    pub fn scheduler(&self) -> &Scheduler<ClientClock> {
        &self.scheduler
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.core.transport
    }
}

impl<S, T: Transport> ClientCore<S, T> {
    fn announce(&mut self) {
        let current_turn = self.lockstep.current_turn();
        debug!(player_id = %self.player_id, current_turn, "sending ready");
        self.transport.send_message(
            Recipient::Server,
            msg_type::PLAYER_READY,
            &PlayerReadyProto {
                player_id: self.player_id.clone(),
                current_turn,
            },
        );
    }

    fn on_message(&mut self, message: RawMessage) {
        let kind = message.msg_type;
        if let Err(err) = self.dispatch(kind, &message.payload) {
            warn!(
                msg_type = msg_type::name(kind).unwrap_or("unknown"),
                %err,
                "dropping server message"
            );
            self.events.push(ClientEvent::MalformedMessage {
                msg_type: kind,
                reason: err.to_string(),
            });
        }
    }

    fn dispatch(&mut self, kind: u8, payload: &[u8]) -> Result<(), ClientError> {
        match kind {
            msg_type::CLIENT_SETUP => {
                let (player, config) = decode::<ClientSetupProto>(payload)?.into_parts()?;
                self.lockstep.set_config(config.clone())?;
                self.lockstep.set_player_number(player)?;
                info!(player, "setup received");
                self.events
                    .push(ClientEvent::SetupReceived { player, config });
            }
            msg_type::CLIENT_START => {
                let start = decode::<ClientStartProto>(payload)?;
                if self.lockstep.player_number().is_none() {
                    return Err(ClientError::NotSetUp);
                }
                self.lockstep.start(start.start_turn);
                self.acked = start.start_turn;
                self.pending_start = Some(start.start_delay_ms);
                self.events.push(ClientEvent::Started {
                    start_turn: start.start_turn,
                    player_ids: start.player_ids,
                });
            }
            msg_type::TURN => {
                let turn = ClosedTurn::try_from(decode::<TurnProto>(payload)?)?;
                self.lockstep.confirm_turn(turn);
            }
            msg_type::EMPTY_TURNS => {
                let empty = decode::<EmptyTurnsProto>(payload)?;
                self.lockstep
                    .confirm_empty_turns(empty.first_turn, empty.count);
            }
            msg_type::COMMAND_REJECTED => {
                let rejected = decode::<CommandRejectedProto>(payload)?;
                let rejection = rejected.rejection()?;
                self.lockstep
                    .on_command_rejected(rejected.seq, rejection, rejected.last_closed_turn);
            }
            msg_type::PARTICIPANT_STATUS => {
                let status = decode::<ParticipantStatusProto>(payload)?;
                self.events.push(ClientEvent::ParticipantStatus {
                    player: status.player()?,
                    connected: status.connected,
                });
            }
            msg_type::SERVER_ERROR => {
                let error = decode::<ServerErrorProto>(payload)?;
                warn!(code = error.code, turn = error.turn, message = %error.message, "server error");
                self.events.push(ClientEvent::ServerError {
                    code: error.code,
                    message: error.message,
                    turn: error.turn,
                });
            }
            other => return Err(WireError::UnknownMessageType(other).into()),
        }
        Ok(())
    }

    /// Send queued submissions and acknowledge newly held turns.
    fn flush(&mut self) {
        for submission in self.lockstep.drain_outbox() {
            self.transport.send_message(
                Recipient::Server,
                msg_type::SUBMIT_COMMAND,
                &SubmitCommandProto::from(&submission),
            );
        }

        let held = self.lockstep.confirmed_through();
        if self.lockstep.is_running() && held > self.acked {
            self.acked = held;
            self.transport.send_message(
                Recipient::Server,
                msg_type::TURN_ACK,
                &TurnAckProto { turn: held },
            );
        }
    }
}

impl<S, T> std::fmt::Debug for ClientController<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientController")
            .field("player_id", &self.core.player_id)
            .field("player", &self.core.lockstep.player_number())
            .field("running", &self.core.lockstep.is_running())
            .field("executed", &self.core.lockstep.current_turn())
            .field("acked", &self.core.acked)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
