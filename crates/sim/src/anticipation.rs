//! Adaptive execution-turn anticipation.
//!
//! A client submits each command for `current turn + lead`. The lead starts
//! at the configured execution anticipation and moves within the
//! `[min, max]` bounds depending on how many recent submissions made it into
//! their target turn.

use crate::config::LockstepConfig;

/// Outcomes collected before the lead is re-evaluated.
pub const SAMPLE_WINDOW: usize = 4;

/// Success rate at or above which the lead shrinks; the mirrored rate
/// (`1 - factor`) or below makes it grow.
pub const ADJUSTMENT_FACTOR: f32 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct AnticipationTuner {
    min: u32,
    max: u32,
    current: u32,
    samples: [bool; SAMPLE_WINDOW],
    next_sample: usize,
}

impl AnticipationTuner {
    pub fn new(min: u32, initial: u32, max: u32) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: initial.clamp(min, max),
            samples: [false; SAMPLE_WINDOW],
            next_sample: 0,
        }
    }

    pub fn from_config(config: &LockstepConfig) -> Self {
        Self::new(
            config.min_execution_turn_anticipation,
            config.execution_turn_anticipation,
            config.max_execution_turn_anticipation,
        )
    }

    /// Current lead in turns.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Record whether a submission landed in its target turn.
    ///
    /// The lead is re-evaluated each time the sample window fills up.
    pub fn record(&mut self, confirmed: bool) -> u32 {
        self.samples[self.next_sample] = confirmed;
        self.next_sample = (self.next_sample + 1) % SAMPLE_WINDOW;

        if self.next_sample == 0 {
            let confirmed = self.samples.iter().filter(|s| **s).count();
            let rate = confirmed as f32 / SAMPLE_WINDOW as f32;
            if rate >= ADJUSTMENT_FACTOR {
                self.current = self.current.saturating_sub(1).max(self.min);
            }
            if rate <= 1.0 - ADJUSTMENT_FACTOR {
                self.current = (self.current + 1).min(self.max);
            }
        }
        self.current
    }

    /// The server saw a submission too far ahead; back off at once.
    pub fn record_too_early(&mut self) -> u32 {
        self.current = self.current.saturating_sub(1).max(self.min);
        self.current
    }
}

// ============================================================================
// Tests
// ============================================================================
