//! Periodic clock.
//!
//! The scheduler is the single logical clock of a lockstep node. Every host
//! timer callback becomes one [`Scheduler::tick`] carrying two deltas:
//! - the *fixed* delta, accumulated per listener to fire deterministic steps
//! - the *real* delta, passed through for diagnostics (stall measurement)
//!
//! Listeners are identified by a small ordered key type (usually an enum) and
//! always run in ascending key order, so the order in which a node closes
//! turns, flushes the network and steps the simulation is fixed by the key's
//! declaration order rather than by registration order.
//!
//! The scheduler owns only timing state. The work itself is done by the
//! dispatch closure passed to [`Scheduler::tick`], which lets the owner keep
//! all mutable component state in plain fields without shared ownership.

use std::fmt::{Debug, Display};

use tracing::error;

/// Result of one attempted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran; its period is consumed.
    Advanced,
    /// The component cannot make progress yet. The accumulated time is kept
    /// and the listener is not fired again during this tick.
    Blocked,
}

/// Timing information handed to a listener for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    pub fixed_delta_ms: u32,
    pub real_delta_ms: u32,
    /// Total fixed time fed to the scheduler, including this tick.
    pub elapsed_ms: u64,
    /// 1-based index of the step about to run for this listener.
    pub step: u64,
}

impl TickContext {
    /// Context for driving a component by hand, outside a scheduler.
    pub fn manual(step: u64) -> Self {
        Self {
            fixed_delta_ms: 0,
            real_delta_ms: 0,
            elapsed_ms: 0,
            step,
        }
    }
}

/// A listener failure caught by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFault<K> {
    pub listener: K,
    pub step: u64,
    pub message: String,
}

/// What happened during one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport<K> {
    /// Steps fired per listener (only listeners that fired at least once).
    pub fired: Vec<(K, u32)>,
    /// Listeners that reported [`StepOutcome::Blocked`].
    pub blocked: Vec<K>,
    /// Faults caught this tick, in listener order.
    pub faults: Vec<ListenerFault<K>>,
}

impl<K> Default for TickReport<K> {
    fn default() -> Self {
        Self {
            fired: Vec::new(),
            blocked: Vec::new(),
            faults: Vec::new(),
        }
    }
}

impl<K: PartialEq> TickReport<K> {
    /// Steps fired for `listener` during this tick.
    pub fn fired_for(&self, listener: K) -> u32 {
        self.fired
            .iter()
            .find(|(id, _)| *id == listener)
            .map_or(0, |(_, steps)| *steps)
    }
}

#[derive(Debug, Clone)]
struct Listener<K> {
    id: K,
    period_ms: u32,
    /// Negative while a start delay is still pending.
    accumulator_ms: i64,
    fired: u64,
}

/// Fixed-order periodic clock.
#[derive(Debug, Clone)]
pub struct Scheduler<K> {
    /// Sorted by `id`.
    listeners: Vec<Listener<K>>,
    max_steps_per_tick: u32,
    elapsed_ms: u64,
    real_elapsed_ms: u64,
}

impl<K> Scheduler<K>
where
    K: Copy + Ord + Debug,
{
    /// Create a scheduler firing at most `max_steps_per_tick` steps per
    /// listener per tick (at least one).
    pub fn new(max_steps_per_tick: u32) -> Self {
        Self {
            listeners: Vec::new(),
            max_steps_per_tick: max_steps_per_tick.max(1),
            elapsed_ms: 0,
            real_elapsed_ms: 0,
        }
    }

    /// Register a listener firing every `period_ms`.
    ///
    /// Idempotent: registering an existing listener changes nothing and
    /// returns `false`.
    pub fn register(&mut self, id: K, period_ms: u32) -> bool {
        self.register_delayed(id, period_ms, 0)
    }

    /// Register a listener whose first period starts after `delay_ms`.
    pub fn register_delayed(&mut self, id: K, period_ms: u32, delay_ms: u32) -> bool {
        let index = match self.listeners.binary_search_by(|l| l.id.cmp(&id)) {
            Ok(_) => return false,
            Err(index) => index,
        };
        self.listeners.insert(
            index,
            Listener {
                id,
                period_ms: period_ms.max(1),
                accumulator_ms: -i64::from(delay_ms),
                fired: 0,
            },
        );
        true
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&mut self, id: K) -> bool {
        match self.listeners.binary_search_by(|l| l.id.cmp(&id)) {
            Ok(index) => {
                self.listeners.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_registered(&self, id: K) -> bool {
        self.listener(id).is_some()
    }

    /// Steps fired so far by `id`.
    pub fn fired(&self, id: K) -> Option<u64> {
        self.listener(id).map(|l| l.fired)
    }

    /// Accumulated, not yet consumed time of `id` (negative during a delay).
    pub fn backlog_ms(&self, id: K) -> Option<i64> {
        self.listener(id).map(|l| l.accumulator_ms)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn real_elapsed_ms(&self) -> u64 {
        self.real_elapsed_ms
    }

    /// Advance the clock and fire due listeners in key order.
    ///
    /// Each listener fires once per full period accumulated, up to the
    /// per-tick bound; leftover time carries over to later ticks. A listener
    /// returning an error has the fault recorded and logged, its step is
    /// consumed, and the remaining listeners still run.
    pub fn tick<E, F>(
        &mut self,
        fixed_delta_ms: u32,
        real_delta_ms: u32,
        mut dispatch: F,
    ) -> TickReport<K>
    where
        E: Display,
        F: FnMut(K, &TickContext) -> Result<StepOutcome, E>,
    {
        self.elapsed_ms += u64::from(fixed_delta_ms);
        self.real_elapsed_ms += u64::from(real_delta_ms);

        let mut report = TickReport::default();

        for listener in &mut self.listeners {
            listener.accumulator_ms += i64::from(fixed_delta_ms);
            let period = i64::from(listener.period_ms);
            let mut steps = 0u32;

            while listener.accumulator_ms >= period && steps < self.max_steps_per_tick {
                let ctx = TickContext {
                    fixed_delta_ms,
                    real_delta_ms,
                    elapsed_ms: self.elapsed_ms,
                    step: listener.fired + 1,
                };

                match dispatch(listener.id, &ctx) {
                    Ok(StepOutcome::Advanced) => {
                        listener.accumulator_ms -= period;
                        listener.fired += 1;
                        steps += 1;
                    }
                    Ok(StepOutcome::Blocked) => {
                        report.blocked.push(listener.id);
                        break;
                    }
                    Err(err) => {
                        error!(listener = ?listener.id, step = ctx.step, %err, "periodic listener failed");
                        report.faults.push(ListenerFault {
                            listener: listener.id,
                            step: ctx.step,
                            message: err.to_string(),
                        });
                        listener.accumulator_ms -= period;
                        listener.fired += 1;
                        steps += 1;
                        break;
                    }
                }
            }

            if steps > 0 {
                report.fired.push((listener.id, steps));
            }
        }

        report
    }

    fn listener(&self, id: K) -> Option<&Listener<K>> {
        self.listeners
            .binary_search_by(|l| l.id.cmp(&id))
            .ok()
            .map(|index| &self.listeners[index])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Clock {
        Turns,
        Simulation,
    }

    fn always_advance(_: Clock, _: &TickContext) -> Result<StepOutcome, String> {
        Ok(StepOutcome::Advanced)
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut scheduler = Scheduler::new(10);
        assert!(scheduler.register(Clock::Simulation, 33));
        assert!(!scheduler.register(Clock::Simulation, 50));
        assert!(scheduler.is_registered(Clock::Simulation));

        assert!(scheduler.unregister(Clock::Simulation));
        assert!(!scheduler.unregister(Clock::Simulation));
        assert!(!scheduler.is_registered(Clock::Simulation));
    }

    #[test]
    fn test_fires_once_per_accumulated_period() {
        let mut scheduler = Scheduler::new(10);
        scheduler.register(Clock::Simulation, 33);

        let report = scheduler.tick(20, 20, always_advance);
        assert_eq!(report.fired_for(Clock::Simulation), 0);

        let report = scheduler.tick(20, 20, always_advance);
        assert_eq!(report.fired_for(Clock::Simulation), 1);
        assert_eq!(scheduler.backlog_ms(Clock::Simulation), Some(7));

        let report = scheduler.tick(198, 198, always_advance);
        assert_eq!(report.fired_for(Clock::Simulation), 6);
        assert_eq!(scheduler.fired(Clock::Simulation), Some(7));
    }

    /// A long frame never triggers an unbounded catch-up loop.
    #[test]
    fn test_catch_up_is_bounded() {
        let mut scheduler = Scheduler::new(4);
        scheduler.register(Clock::Simulation, 10);

        let report = scheduler.tick(100, 100, always_advance);
        assert_eq!(report.fired_for(Clock::Simulation), 4);
        assert_eq!(scheduler.backlog_ms(Clock::Simulation), Some(60));

        let report = scheduler.tick(0, 0, always_advance);
        assert_eq!(report.fired_for(Clock::Simulation), 4);
    }

    #[test]
    fn test_listeners_run_in_key_order() {
        let mut scheduler = Scheduler::new(10);
        scheduler.register(Clock::Simulation, 10);
        scheduler.register(Clock::Turns, 10);

        let mut order = Vec::new();
        scheduler.tick(10, 10, |id, _| {
            order.push(id);
            Ok::<_, String>(StepOutcome::Advanced)
        });
        assert_eq!(order, vec![Clock::Turns, Clock::Simulation]);
    }

    #[test]
    fn test_blocked_listener_keeps_time() {
        let mut scheduler = Scheduler::new(10);
        scheduler.register(Clock::Simulation, 10);

        let report = scheduler.tick(30, 30, |_, _| Ok::<_, String>(StepOutcome::Blocked));
        assert_eq!(report.blocked, vec![Clock::Simulation]);
        assert_eq!(report.fired_for(Clock::Simulation), 0);
        assert_eq!(scheduler.backlog_ms(Clock::Simulation), Some(30));

        let report = scheduler.tick(0, 0, always_advance);
        assert_eq!(report.fired_for(Clock::Simulation), 3);
    }

    /// One failing listener does not stop the others.
    #[test]
    fn test_fault_is_isolated_per_listener() {
        let mut scheduler = Scheduler::new(10);
        scheduler.register(Clock::Turns, 10);
        scheduler.register(Clock::Simulation, 10);

        let mut simulated = 0;
        let report = scheduler.tick(20, 20, |id, _| match id {
            Clock::Turns => Err("closing failed".to_string()),
            Clock::Simulation => {
                simulated += 1;
                Ok(StepOutcome::Advanced)
            }
        });

        assert_eq!(simulated, 2);
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].listener, Clock::Turns);
        assert_eq!(report.faults[0].message, "closing failed");
        // The faulty step is consumed so the next tick does not replay it.
        assert_eq!(scheduler.backlog_ms(Clock::Turns), Some(10));
    }

    #[test]
    fn test_start_delay() {
        let mut scheduler = Scheduler::new(10);
        scheduler.register_delayed(Clock::Turns, 100, 250);

        assert_eq!(scheduler.tick(300, 300, always_advance).fired_for(Clock::Turns), 0);
        assert_eq!(scheduler.tick(50, 50, always_advance).fired_for(Clock::Turns), 1);
    }

    #[test]
    fn test_context_reports_step_and_elapsed() {
        let mut scheduler = Scheduler::new(10);
        scheduler.register(Clock::Simulation, 10);

        let mut seen = Vec::new();
        scheduler.tick(20, 25, |_, ctx| {
            seen.push((ctx.step, ctx.elapsed_ms, ctx.real_delta_ms));
            Ok::<_, String>(StepOutcome::Advanced)
        });
        assert_eq!(seen, vec![(1, 20, 25), (2, 20, 25)]);
        assert_eq!(scheduler.real_elapsed_ms(), 25);
    }
}
