//! In-memory session harness: one server, N clients, one shared wire.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use lockstep_client::ClientController;
use lockstep_server::ServerController;
use lockstep_sim::{
    CommandError, CommandPayload, CommandTypeId, Lockstep, LockstepConfig, PayloadError,
    PlayerNumber,
};
use lockstep_wire::msg_type;
use lockstep_wire::transport::{ClientId, RawMessage, Recipient, SERVER_ID, Transport, TransportEvent};

pub const FRAME_MS: u32 = 20;

// ============================================================================
// Game
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    pub applied: Vec<(PlayerNumber, u8)>,
    pub total: u64,
    pub tick: u64,
}

/// Adds its value to the tally. Zero is refused by the game logic.
pub struct Add(pub u8);

impl CommandPayload for Add {
    const TYPE_ID: CommandTypeId = 1;
    const NAME: &'static str = "add";

    fn encode_payload(&self) -> Vec<u8> {
        vec![self.0]
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self, PayloadError> {
        match bytes {
            [value] => Ok(Self(*value)),
            _ => Err(PayloadError::Invalid(format!("{} bytes", bytes.len()))),
        }
    }
}

/// Same logic on every execution path.
pub fn install(lockstep: &mut Lockstep<Tally>) {
    lockstep.register_command_logic::<Add, _>(|add, player, tally: &mut Tally| {
        if add.0 == 0 {
            return Err(CommandError::rejected("nothing to add"));
        }
        tally.applied.push((player, add.0));
        tally.total += u64::from(add.0);
        Ok(())
    });
    lockstep.set_simulation(|tick, tally| tally.tick = tick);
}

pub fn config(players_count: u8) -> LockstepConfig {
    LockstepConfig {
        simulation_step_ms: 10,
        command_step_factor: 2,
        players_count,
        start_delay_ms: 0,
        ..LockstepConfig::default()
    }
}

// ============================================================================
// Wire
// ============================================================================

#[derive(Debug, Clone)]
struct Envelope {
    from: ClientId,
    to: Recipient,
    msg_type: u8,
    payload: Vec<u8>,
}

type Wire = Rc<RefCell<Vec<Envelope>>>;

pub struct Link {
    id: ClientId,
    wire: Wire,
}

impl Transport for Link {
    fn send(&mut self, to: Recipient, msg_type: u8, payload: Vec<u8>) {
        self.wire.borrow_mut().push(Envelope {
            from: self.id,
            to,
            msg_type,
            payload,
        });
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub server: ServerController<Tally, Link>,
    pub clients: Vec<ClientController<Tally, Link>>,
    wire: Wire,
    connected: Vec<bool>,
    /// Deliver every submission and turn twice.
    pub duplicate: bool,
    /// Clients whose messages to the server are lost.
    pub muted: BTreeSet<usize>,
}

impl Harness {
    pub fn new(config: LockstepConfig, clients: usize) -> Self {
        let wire = Wire::default();
        let mut server = ServerController::new(
            config,
            Tally::default(),
            Link {
                id: SERVER_ID,
                wire: wire.clone(),
            },
        )
        .unwrap();
        install(server.authority_mut());

        let clients = (0..clients)
            .map(|index| {
                let link = Link {
                    id: Self::client_id(index),
                    wire: wire.clone(),
                };
                let mut client =
                    ClientController::new(format!("player-{index}"), Tally::default(), link)
                        .unwrap();
                install(client.lockstep_mut());
                client
            })
            .collect::<Vec<_>>();

        Self {
            connected: vec![false; clients.len()],
            server,
            clients,
            wire,
            duplicate: false,
            muted: BTreeSet::new(),
        }
    }

    pub fn client_id(index: usize) -> ClientId {
        index as ClientId + 1
    }

    pub fn connect(&mut self, index: usize) {
        let id = Self::client_id(index);
        self.connected[index] = true;
        self.server.handle_event(TransportEvent::Connected(id));
        self.clients[index].handle_event(TransportEvent::Connected(SERVER_ID));
        self.pump();
    }

    pub fn connect_all(&mut self) {
        for index in 0..self.clients.len() {
            self.connect(index);
        }
    }

    pub fn disconnect(&mut self, index: usize) {
        self.connected[index] = false;
        self.server
            .handle_event(TransportEvent::Disconnected(Self::client_id(index)));
        self.clients[index].handle_event(TransportEvent::Disconnected(SERVER_ID));
        self.pump();
    }

    pub fn queue(&mut self, index: usize, value: u8) {
        self.clients[index]
            .lockstep_mut()
            .add_pending_command(&Add(value))
            .unwrap();
    }

    /// One host frame: server first, then every connected client.
    pub fn frame(&mut self) {
        self.server.tick(FRAME_MS, FRAME_MS);
        self.pump();
        for index in 0..self.clients.len() {
            if self.connected[index] {
                self.clients[index].tick(FRAME_MS, FRAME_MS);
                self.pump();
            }
        }
    }

    pub fn frames(&mut self, count: usize) {
        for _ in 0..count {
            self.frame();
        }
    }

    /// Tick one client alone until it executed `turn`.
    pub fn catch_up(&mut self, index: usize, turn: u64) {
        for _ in 0..1000 {
            if self.clients[index].lockstep().current_turn() >= turn {
                return;
            }
            self.clients[index].tick(FRAME_MS, FRAME_MS);
            self.pump();
        }
        panic!("client {index} never reached turn {turn}");
    }

    /// Deliver everything on the wire until it stays empty.
    pub fn pump(&mut self) {
        for _ in 0..100 {
            let batch: Vec<Envelope> = std::mem::take(&mut *self.wire.borrow_mut());
            if batch.is_empty() {
                return;
            }
            for envelope in batch {
                self.deliver(envelope);
            }
        }
        panic!("wire never drained");
    }

    fn deliver(&mut self, envelope: Envelope) {
        let copies = if self.duplicate
            && matches!(
                envelope.msg_type,
                msg_type::SUBMIT_COMMAND | msg_type::TURN | msg_type::EMPTY_TURNS
            ) {
            2
        } else {
            1
        };

        let message = RawMessage {
            from: envelope.from,
            msg_type: envelope.msg_type,
            payload: envelope.payload,
        };
        match envelope.to {
            Recipient::Server => {
                let index = envelope.from as usize - 1;
                if self.muted.contains(&index) || !self.connected[index] {
                    return;
                }
                for _ in 0..copies {
                    self.server
                        .handle_event(TransportEvent::Message(message.clone()));
                }
            }
            Recipient::One(id) => {
                let index = id as usize - 1;
                if self.connected[index] {
                    for _ in 0..copies {
                        self.clients[index].handle_event(TransportEvent::Message(message.clone()));
                    }
                }
            }
        }
    }

    /// Every connected client executed exactly what the server executed.
    pub fn assert_converged(&self) {
        let authority = self.server.authority();
        for (index, client) in self.clients.iter().enumerate() {
            if !self.connected[index] {
                continue;
            }
            let lockstep = client.lockstep();
            assert_eq!(
                lockstep.current_turn(),
                authority.current_turn(),
                "client {index} turn"
            );
            assert_eq!(lockstep.state(), authority.state(), "client {index} state");
            assert_eq!(lockstep.digest(), authority.digest(), "client {index} digest");
        }
    }

    /// Local commands dropped after running out of retries, all clients.
    pub fn discarded(&self) -> u64 {
        self.clients
            .iter()
            .map(|c| c.lockstep().stats().discarded_commands)
            .sum()
    }
}
