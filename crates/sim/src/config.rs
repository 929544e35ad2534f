//! Session configuration.
//!
//! A [`LockstepConfig`] is created once when a session is set up and is
//! never mutated afterward. Hosts usually hand it over as key/value strings;
//! [`LockstepConfig::from_properties`] coerces those to integers and falls
//! back to the defaults below for anything it cannot parse.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

use crate::error::ConfigError;
use crate::{SimTick, Turn};

// ============================================================================
// Defaults
// ============================================================================

/// Milliseconds per simulation step.
pub const DEFAULT_SIMULATION_STEP_MS: u32 = 33;

/// Simulation steps per command turn.
pub const DEFAULT_COMMAND_STEP_FACTOR: u32 = 6;

/// Lowest lead (in turns) a client may adapt down to.
pub const DEFAULT_MIN_EXECUTION_TURN_ANTICIPATION: u32 = 1;

/// Highest lead (in turns) a client may adapt up to.
pub const DEFAULT_MAX_EXECUTION_TURN_ANTICIPATION: u32 = 6;

/// Acceptance horizon past the last closed turn.
pub const DEFAULT_EXECUTION_TURN_ANTICIPATION: u32 = 2;

/// Command steps a due turn waits on a silent participant.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_PLAYERS_COUNT: u8 = 2;

pub const DEFAULT_START_DELAY_MS: u32 = 3000;

/// Upper bound on steps fired per listener per scheduler tick.
pub const DEFAULT_MAX_SIMULATION_STEPS_PER_TICK: u32 = 10;

/// Executed turns kept for late acknowledgements and reconnects.
pub const DEFAULT_RETIRE_GRACE_TURNS: u32 = 64;

/// Property keys understood by [`LockstepConfig::from_properties`].
pub mod keys {
    pub const SIMULATION_STEP: &str = "SimulationStep";
    pub const COMMAND_STEP_FACTOR: &str = "CommandStepFactor";
    pub const MIN_EXECUTION_TURN_ANTICIPATION: &str = "MinExecutionTurnAnticipation";
    pub const MAX_EXECUTION_TURN_ANTICIPATION: &str = "MaxExecutionTurnAnticipation";
    pub const EXECUTION_TURN_ANTICIPATION: &str = "ExecutionTurnAnticipation";
    pub const MAX_RETRIES: &str = "MaxRetries";
    pub const PLAYERS_COUNT: &str = "PlayersCount";
    pub const START_DELAY: &str = "StartDelay";
    pub const MAX_SIMULATION_STEPS_PER_FRAME: &str = "MaxSimulationStepsPerFrame";
    pub const RETIRE_GRACE_TURNS: &str = "RetireGraceTurns";
}

// ============================================================================
// LockstepConfig
// ============================================================================

/// Immutable per-session lockstep parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockstepConfig {
    pub simulation_step_ms: u32,
    pub command_step_factor: u32,
    pub min_execution_turn_anticipation: u32,
    pub max_execution_turn_anticipation: u32,
    pub execution_turn_anticipation: u32,
    pub max_retries: u32,
    pub players_count: u8,
    pub start_delay_ms: u32,
    pub max_simulation_steps_per_tick: u32,
    pub retire_grace_turns: u32,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            simulation_step_ms: DEFAULT_SIMULATION_STEP_MS,
            command_step_factor: DEFAULT_COMMAND_STEP_FACTOR,
            min_execution_turn_anticipation: DEFAULT_MIN_EXECUTION_TURN_ANTICIPATION,
            max_execution_turn_anticipation: DEFAULT_MAX_EXECUTION_TURN_ANTICIPATION,
            execution_turn_anticipation: DEFAULT_EXECUTION_TURN_ANTICIPATION,
            max_retries: DEFAULT_MAX_RETRIES,
            players_count: DEFAULT_PLAYERS_COUNT,
            start_delay_ms: DEFAULT_START_DELAY_MS,
            max_simulation_steps_per_tick: DEFAULT_MAX_SIMULATION_STEPS_PER_TICK,
            retire_grace_turns: DEFAULT_RETIRE_GRACE_TURNS,
        }
    }
}

impl LockstepConfig {
    /// Build a config from host key/value properties.
    ///
    /// Unknown keys are ignored and unparsable values keep their default.
    /// The result is validated before it is returned.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in properties {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                keys::SIMULATION_STEP => {
                    config.simulation_step_ms = parse_option(key, value, config.simulation_step_ms);
                }
                keys::COMMAND_STEP_FACTOR => {
                    config.command_step_factor =
                        parse_option(key, value, config.command_step_factor);
                }
                keys::MIN_EXECUTION_TURN_ANTICIPATION => {
                    config.min_execution_turn_anticipation =
                        parse_option(key, value, config.min_execution_turn_anticipation);
                }
                keys::MAX_EXECUTION_TURN_ANTICIPATION => {
                    config.max_execution_turn_anticipation =
                        parse_option(key, value, config.max_execution_turn_anticipation);
                }
                keys::EXECUTION_TURN_ANTICIPATION => {
                    config.execution_turn_anticipation =
                        parse_option(key, value, config.execution_turn_anticipation);
                }
                keys::MAX_RETRIES => {
                    config.max_retries = parse_option(key, value, config.max_retries);
                }
                keys::PLAYERS_COUNT => {
                    config.players_count = parse_option(key, value, config.players_count);
                }
                keys::START_DELAY => {
                    config.start_delay_ms = parse_option(key, value, config.start_delay_ms);
                }
                keys::MAX_SIMULATION_STEPS_PER_FRAME => {
                    config.max_simulation_steps_per_tick =
                        parse_option(key, value, config.max_simulation_steps_per_tick);
                }
                keys::RETIRE_GRACE_TURNS => {
                    config.retire_grace_turns =
                        parse_option(key, value, config.retire_grace_turns);
                }
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulation_step_ms == 0 {
            return Err(ConfigError::Zero {
                key: keys::SIMULATION_STEP,
            });
        }
        if self.command_step_factor == 0 {
            return Err(ConfigError::Zero {
                key: keys::COMMAND_STEP_FACTOR,
            });
        }
        if self.players_count == 0 {
            return Err(ConfigError::Zero {
                key: keys::PLAYERS_COUNT,
            });
        }
        if self.execution_turn_anticipation == 0 {
            return Err(ConfigError::Zero {
                key: keys::EXECUTION_TURN_ANTICIPATION,
            });
        }
        let (min, execution, max) = (
            self.min_execution_turn_anticipation,
            self.execution_turn_anticipation,
            self.max_execution_turn_anticipation,
        );
        if min > execution || execution > max {
            return Err(ConfigError::AnticipationOrder {
                min,
                execution,
                max,
            });
        }
        Ok(())
    }

    /// Milliseconds per command turn.
    pub fn command_step_ms(&self) -> u32 {
        self.simulation_step_ms
            .saturating_mul(self.command_step_factor)
    }

    /// Simulation tick on which `turn` executes.
    pub fn turn_boundary(&self, turn: Turn) -> SimTick {
        turn.saturating_mul(u64::from(self.command_step_factor))
    }
}

/// Parse one property, keeping `default` when the value is unusable.
fn parse_option<T>(key: &str, raw: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, raw, %default, "unparsable config value, keeping default");
            default
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
