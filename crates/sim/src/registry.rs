//! Typed command registry.
//!
//! Two tables live here:
//! - [`CommandFactory`]: type id → codec entry, used to materialize (and so
//!   validate) command payloads arriving as bytes. It is plain data and can
//!   be cloned into network controllers.
//! - [`CommandRegistry`]: the factory plus the command logic of one execution
//!   path. Every lockstep instance owns its own registry, so the server's
//!   authoritative logic and a client's local logic for the same type id
//!   never see each other's commands.

use std::collections::BTreeMap;
use std::fmt;

use crate::command::{Command, CommandPayload};
use crate::error::{CommandError, PayloadError};
use crate::{CommandTypeId, PlayerNumber};

/// Boxed command logic bound to a state type.
pub type CommandLogic<S> = Box<dyn FnMut(&Command, &mut S) -> Result<(), CommandError>>;

type Materialize = fn(&[u8]) -> Result<(), PayloadError>;

#[derive(Clone, Copy)]
struct CommandKind {
    name: &'static str,
    materialize: Materialize,
}

fn materialize<C: CommandPayload>(bytes: &[u8]) -> Result<(), PayloadError> {
    C::decode_payload(bytes).map(|_| ())
}

// ============================================================================
// Command Factory
// ============================================================================

/// Registered command types and their payload codecs.
#[derive(Clone, Default)]
pub struct CommandFactory {
    kinds: BTreeMap<CommandTypeId, CommandKind>,
}

impl CommandFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `C`. Returns `false` if its type id was already known.
    pub fn register<C: CommandPayload>(&mut self) -> bool {
        if self.kinds.contains_key(&C::TYPE_ID) {
            return false;
        }
        self.kinds.insert(
            C::TYPE_ID,
            CommandKind {
                name: C::NAME,
                materialize: materialize::<C>,
            },
        );
        true
    }

    pub fn contains(&self, type_id: CommandTypeId) -> bool {
        self.kinds.contains_key(&type_id)
    }

    pub fn name(&self, type_id: CommandTypeId) -> Option<&'static str> {
        self.kinds.get(&type_id).map(|k| k.name)
    }

    /// Check that `command` is of a known type and its payload decodes.
    pub fn materialize(&self, command: &Command) -> Result<(), CommandError> {
        let kind = self
            .kinds
            .get(&command.type_id)
            .ok_or(CommandError::Unregistered {
                type_id: command.type_id,
            })?;
        (kind.materialize)(&command.payload).map_err(|source| CommandError::Payload {
            type_id: command.type_id,
            source,
        })
    }
}

impl fmt::Debug for CommandFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.kinds.iter().map(|(id, kind)| (id, kind.name)))
            .finish()
    }
}

// ============================================================================
// Command Registry
// ============================================================================

/// Command types plus the logic applied to them on one execution path.
pub struct CommandRegistry<S> {
    factory: CommandFactory,
    logic: BTreeMap<CommandTypeId, Vec<CommandLogic<S>>>,
}

impl<S> Default for CommandRegistry<S> {
    fn default() -> Self {
        Self {
            factory: CommandFactory::default(),
            logic: BTreeMap::new(),
        }
    }
}

impl<S> CommandRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> &CommandFactory {
        &self.factory
    }

    /// Make `C` known without attaching logic to it.
    pub fn register_command<C: CommandPayload>(&mut self) -> bool {
        self.factory.register::<C>()
    }

    /// Attach logic to `C`, registering the type if needed.
    ///
    /// Several handlers may be attached to one type; they run in
    /// registration order.
    pub fn register_logic<C, F>(&mut self, mut handler: F)
    where
        C: CommandPayload,
        F: FnMut(&C, PlayerNumber, &mut S) -> Result<(), CommandError> + 'static,
    {
        self.factory.register::<C>();
        self.logic
            .entry(C::TYPE_ID)
            .or_default()
            .push(Box::new(move |command, state| {
                let payload = command.decode::<C>()?;
                handler(&payload, command.player, state)
            }));
    }

    /// Drop every handler attached to `type_id`, keeping the type registered.
    pub fn clear_logic(&mut self, type_id: CommandTypeId) -> usize {
        self.logic.remove(&type_id).map_or(0, |handlers| handlers.len())
    }

    pub fn logic_count(&self, type_id: CommandTypeId) -> usize {
        self.logic.get(&type_id).map_or(0, Vec::len)
    }

    /// Run every handler attached to the command's type.
    ///
    /// Returns the number of handlers run. A type with no handlers is fine;
    /// a type the factory does not know is an error.
    pub fn dispatch(&mut self, command: &Command, state: &mut S) -> Result<usize, CommandError> {
        if !self.factory.contains(command.type_id) {
            return Err(CommandError::Unregistered {
                type_id: command.type_id,
            });
        }
        let Some(handlers) = self.logic.get_mut(&command.type_id) else {
            return Ok(0);
        };
        for handler in handlers.iter_mut() {
            handler(command, state)?;
        }
        Ok(handlers.len())
    }
}

impl<S> fmt::Debug for CommandRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("factory", &self.factory)
            .field(
                "logic",
                &self
                    .logic
                    .iter()
                    .map(|(id, handlers)| (*id, handlers.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
