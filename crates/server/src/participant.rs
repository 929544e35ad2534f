//! Participants of a lockstep session.
//!
//! Player numbers are assigned in join order starting at 0 and never reused
//! within a session. A participant that comes back with the same player id
//! token gets its old number back.

use lockstep_sim::{CommandSeq, PlayerNumber, Turn};
use lockstep_wire::transport::ClientId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("all {capacity} player slots are taken")]
    MatchFull { capacity: u8 },

    #[error("player {player_id} is already connected")]
    AlreadyConnected { player_id: String },
}

/// Outcome of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Joined {
    New(PlayerNumber),
    Rejoined(PlayerNumber),
}

impl Joined {
    pub fn player(&self) -> PlayerNumber {
        match self {
            Self::New(player) | Self::Rejoined(player) => *player,
        }
    }
}

/// Per-participant server state.
#[derive(Debug, Clone)]
pub struct Participant {
    pub player: PlayerNumber,
    pub player_id: String,
    /// Transport handle; `None` for a client living in the server process.
    pub client: Option<ClientId>,
    pub connected: bool,
    /// Highest turn the participant confirmed receiving.
    pub acked: Turn,
    /// Highest closed turn sent to the participant.
    pub delivered: Turn,
    /// Command steps the oldest due turn has waited on this participant.
    pub retries: u32,
    /// Highest submission seq closed into a turn.
    pub closed_seq: CommandSeq,
}

impl Participant {
    fn new(player: PlayerNumber, player_id: &str, client: Option<ClientId>) -> Self {
        Self {
            player,
            player_id: player_id.to_string(),
            client,
            connected: true,
            acked: 0,
            delivered: 0,
            retries: 0,
            closed_seq: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.client.is_none()
    }
}

/// Participants indexed by player number.
#[derive(Debug, Clone)]
pub struct ParticipantArena {
    capacity: u8,
    participants: Vec<Participant>,
}

impl ParticipantArena {
    pub fn new(capacity: u8) -> Self {
        Self {
            capacity,
            participants: Vec::with_capacity(usize::from(capacity)),
        }
    }

    /// Admit `player_id`, reusing its number if it joined before.
    pub fn join(&mut self, player_id: &str, client: Option<ClientId>) -> Result<Joined, JoinError> {
        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.player_id == player_id)
        {
            if existing.connected {
                return Err(JoinError::AlreadyConnected {
                    player_id: player_id.to_string(),
                });
            }
            existing.connected = true;
            existing.client = client;
            existing.retries = 0;
            return Ok(Joined::Rejoined(existing.player));
        }

        if self.participants.len() >= usize::from(self.capacity) {
            return Err(JoinError::MatchFull {
                capacity: self.capacity,
            });
        }
        let player = self.participants.len() as PlayerNumber;
        self.participants
            .push(Participant::new(player, player_id, client));
        Ok(Joined::New(player))
    }

    /// Mark `player` disconnected. Returns `false` if it was not connected.
    pub fn disconnect(&mut self, player: PlayerNumber) -> bool {
        match self.get_mut(player) {
            Some(participant) if participant.connected => {
                participant.connected = false;
                participant.client = None;
                participant.retries = 0;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, player: PlayerNumber) -> Option<&Participant> {
        self.participants.get(usize::from(player))
    }

    pub fn get_mut(&mut self, player: PlayerNumber) -> Option<&mut Participant> {
        self.participants.get_mut(usize::from(player))
    }

    pub fn by_client(&self, client: ClientId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connected && p.client == Some(client))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.iter_mut()
    }

    pub fn connected(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.connected)
    }

    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Player id tokens indexed by player number.
    pub fn player_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.player_id.clone())
            .collect()
    }
}
