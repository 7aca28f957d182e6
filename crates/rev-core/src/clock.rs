use crate::history::HistoryFeed;
use crate::integrator::DynamicsIntegrator;
use crate::monitor::{InstabilityMonitor, NumericalInstabilityWarning};
use crate::state::{EngineState, SimulationLimits};
use crate::sync::StateExchange;
use crate::torque::{CurveTorqueModel, TorqueModel};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct ClockConfig {
    pub tick_period: Duration,
    /// More steps than this in one iteration means the loop was paused or
    /// starved; the backlog is discarded instead of replayed.
    pub max_steps_per_iteration: u32,
    /// Remaining wait below which the loop spins instead of sleeping.
    pub spin_threshold: Duration,
    pub limits: SimulationLimits,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(1),
            max_steps_per_iteration: 100,
            spin_threshold: Duration::from_micros(200),
            limits: SimulationLimits::default(),
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct ClockStats {
    pub ticks_executed: u64,
    pub iterations: u64,
    pub stalls_recovered: u64,
    pub instability_excursions: u64,
    pub max_steps_in_iteration: u32,
    pub max_jitter_us: u64,
    pub history_dropped: u64,
}

/// Wall-clock time jumped further than the step bound allows; accumulated
/// time was thrown away and the simulation carries on from its current state.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("simulation stalled for {skipped:?} ({steps_dropped} steps behind) at tick {tick}; accumulator reset")]
pub struct SimulationStallRecovered {
    pub tick: u64,
    pub skipped: Duration,
    pub steps_dropped: u64,
}

/// Conditions the clock absorbs and reports instead of failing on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    StallRecovered(SimulationStallRecovered),
    NumericalInstability(NumericalInstabilityWarning),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PumpReport {
    pub steps: u32,
    pub stall: Option<SimulationStallRecovered>,
}

/// Fixed-step driver for the integrator. Owns the only writer side of the
/// state exchange.
pub struct SimulationClock<M: TorqueModel = CurveTorqueModel> {
    integrator: DynamicsIntegrator<M>,
    exchange: Arc<StateExchange>,
    config: ClockConfig,
    state: EngineState,
    accumulator: Duration,
    monitor: InstabilityMonitor,
    history: Option<HistoryFeed>,
    stats: ClockStats,
}

impl<M: TorqueModel> SimulationClock<M> {
    pub fn new(
        integrator: DynamicsIntegrator<M>,
        exchange: Arc<StateExchange>,
        config: ClockConfig,
    ) -> Self {
        let state = integrator.initial_state();
        Self {
            integrator,
            exchange,
            config,
            state,
            accumulator: Duration::ZERO,
            monitor: InstabilityMonitor::new(),
            history: None,
            stats: ClockStats::default(),
        }
    }

    pub fn with_history(mut self, feed: HistoryFeed) -> Self {
        self.history = Some(feed);
        self
    }

    /// Advance by one fixed step and publish the result.
    pub fn step_once<F: FnMut(&ClockEvent)>(&mut self, on_event: &mut F) -> EngineState {
        let control = self.exchange.read_control();
        let dt_s = self.config.tick_period.as_secs_f64();
        let outcome = self.integrator.step(&self.state, control, dt_s);

        if let Some(warning) = self
            .monitor
            .observe(&outcome, self.config.limits.max_angular_acceleration)
        {
            self.stats.instability_excursions += 1;
            on_event(&ClockEvent::NumericalInstability(warning));
        }
        if outcome.rpm_clamped && outcome.state.rpm > 0.0 {
            debug!(
                "rpm clamped to {:.1} at tick {}",
                outcome.state.rpm, outcome.state.tick
            );
        }

        self.state = outcome.state;
        self.exchange.publish_state(self.state);
        if let Some(feed) = self.history.as_mut() {
            feed.push(self.state);
            self.stats.history_dropped = feed.dropped();
        }
        self.stats.ticks_executed += 1;
        self.state
    }

    /// Account for `elapsed` wall-clock time: run as many whole steps as it
    /// covers and carry the remainder, unless the backlog exceeds the bound.
    pub fn pump<F: FnMut(&ClockEvent)>(&mut self, elapsed: Duration, on_event: &mut F) -> PumpReport {
        self.accumulator = self.accumulator.saturating_add(elapsed);
        self.stats.iterations += 1;

        let tick_ns = self.config.tick_period.as_nanos().max(1);
        let due = self.accumulator.as_nanos() / tick_ns;

        if due > u128::from(self.config.max_steps_per_iteration) {
            let stall = SimulationStallRecovered {
                tick: self.state.tick,
                skipped: self.accumulator,
                steps_dropped: u64::try_from(due).unwrap_or(u64::MAX),
            };
            self.accumulator = Duration::ZERO;
            self.stats.stalls_recovered += 1;
            warn!("{stall}");
            on_event(&ClockEvent::StallRecovered(stall));
            return PumpReport {
                steps: 0,
                stall: Some(stall),
            };
        }

        // Bounded by max_steps_per_iteration above.
        let steps = due as u32;
        for _ in 0..steps {
            self.step_once(on_event);
            self.accumulator -= self.config.tick_period;
        }
        self.stats.max_steps_in_iteration = self.stats.max_steps_in_iteration.max(steps);

        PumpReport { steps, stall: None }
    }

    /// Advance by `elapsed` of simulated time under the caller's control
    /// (offline rendering). Nothing can have stalled, so every covered step
    /// runs regardless of `max_steps_per_iteration`; the remainder carries.
    pub fn advance<F: FnMut(&ClockEvent)>(&mut self, elapsed: Duration, on_event: &mut F) -> u64 {
        self.accumulator = self.accumulator.saturating_add(elapsed);
        self.stats.iterations += 1;

        let tick = self.config.tick_period;
        let mut steps = 0u64;
        while !tick.is_zero() && self.accumulator >= tick {
            self.step_once(on_event);
            self.accumulator -= tick;
            steps += 1;
        }
        let steps_u32 = u32::try_from(steps).unwrap_or(u32::MAX);
        self.stats.max_steps_in_iteration = self.stats.max_steps_in_iteration.max(steps_u32);
        steps
    }

    /// Drive the clock from the wall clock until `stop` is raised. The flag
    /// is checked between iterations.
    pub fn run<F: FnMut(&ClockEvent)>(&mut self, stop: &AtomicBool, mut on_event: F) {
        let mut last = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            let elapsed = now.duration_since(last);
            last = now;
            self.pump(elapsed, &mut on_event);

            let remaining = self.config.tick_period.saturating_sub(self.accumulator);
            let deadline = Instant::now() + remaining;
            if remaining > self.config.spin_threshold {
                std::thread::sleep(remaining - self.config.spin_threshold);
            }
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }

            let late_us = Instant::now().saturating_duration_since(deadline).as_micros() as u64;
            self.stats.max_jitter_us = self.stats.max_jitter_us.max(late_us);
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn accumulator(&self) -> Duration {
        self.accumulator
    }

    pub fn stats(&self) -> &ClockStats {
        &self.stats
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<StateExchange> {
        &self.exchange
    }

    pub fn integrator(&self) -> &DynamicsIntegrator<M> {
        &self.integrator
    }

    pub fn into_parts(self) -> (DynamicsIntegrator<M>, Option<HistoryFeed>, ClockStats) {
        (self.integrator, self.history, self.stats)
    }
}
