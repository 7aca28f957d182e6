//! One simulated engine and everything attached to it.
//!
//! A [`Session`] owns the validated parameters, the torque model, the state
//! exchange and the history window. Nothing here is global, so several
//! sessions can run side by side. Parameters can only be replaced while the
//! session is stopped; a running session is a different type.

use crate::clock::{ClockConfig, ClockEvent, ClockStats, SimulationClock};
use crate::error::{ConfigurationError, SessionError};
use crate::history::{history_channel, HistoryFeed, SharedHistory};
use crate::integrator::DynamicsIntegrator;
use crate::params::{EngineParameters, ParameterSheet};
use crate::state::{ControlInput, EngineState};
use crate::synth::{AudioSynthesizer, SynthConfig};
use crate::sync::StateExchange;
use crate::torque::TorqueModel;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub clock: ClockConfig,
    /// Length of the retained history window.
    pub history_seconds: f64,
    /// States that may queue between two history drains.
    pub feed_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            history_seconds: 10.0,
            feed_capacity: 8_192,
        }
    }
}

impl SessionConfig {
    pub fn history_capacity(&self) -> usize {
        let tick_s = self.clock.tick_period.as_secs_f64();
        if tick_s <= 0.0 || !self.history_seconds.is_finite() {
            return 1;
        }
        ((self.history_seconds.max(0.0) / tick_s).round() as usize).max(1)
    }
}

/// Cloneable writer for operator input. Latest value wins.
#[derive(Clone)]
pub struct ControlHandle {
    exchange: Arc<StateExchange>,
}

impl ControlHandle {
    pub fn submit(&self, control: ControlInput) {
        self.exchange.submit_control(control);
    }

    pub fn set(&self, throttle: f64, load_torque_nm: f64) {
        self.submit(ControlInput::new(throttle, load_torque_nm));
    }

    pub fn current(&self) -> ControlInput {
        self.exchange.read_control()
    }
}

pub struct Session<M: TorqueModel> {
    params: Arc<EngineParameters>,
    model: M,
    config: SessionConfig,
    exchange: Arc<StateExchange>,
    history: SharedHistory,
    feed: HistoryFeed,
}

impl<M: TorqueModel + 'static> Session<M> {
    /// Validate `sheet` and set up a stopped session. Configuration errors
    /// surface here and nowhere later.
    pub fn new(sheet: ParameterSheet, model: M, config: SessionConfig) -> Result<Self, ConfigurationError> {
        let params = EngineParameters::new(sheet)?;
        Ok(Self::with_parameters(params, model, config))
    }

    pub fn with_parameters(params: EngineParameters, model: M, config: SessionConfig) -> Self {
        let (feed, history) = history_channel(config.history_capacity(), config.feed_capacity);
        info!(
            "session '{}' configured: model={}, history={} states",
            params.name(),
            model.name(),
            history.capacity()
        );
        Self {
            params: Arc::new(params),
            model,
            config,
            exchange: Arc::new(StateExchange::new()),
            history: history.into_shared(),
            feed,
        }
    }

    pub fn params(&self) -> &Arc<EngineParameters> {
        &self.params
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn exchange(&self) -> Arc<StateExchange> {
        Arc::clone(&self.exchange)
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            exchange: Arc::clone(&self.exchange),
        }
    }

    pub fn history(&self) -> SharedHistory {
        Arc::clone(&self.history)
    }

    pub fn latest_state(&self) -> Option<EngineState> {
        self.exchange.read_state()
    }

    /// A synthesizer bound to this session's exchange and harmonic table.
    pub fn synthesizer(&self, config: SynthConfig) -> AudioSynthesizer {
        AudioSynthesizer::new(Arc::clone(&self.exchange), &self.params, config)
    }

    /// Validate and install new parameters. Only possible on a stopped
    /// session; the next run starts from the new idle speed.
    pub fn replace_parameters(&mut self, sheet: ParameterSheet) -> Result<(), ConfigurationError> {
        let params = EngineParameters::new(sheet)?;
        info!("session parameters replaced with '{}'", params.name());
        self.params = Arc::new(params);
        Ok(())
    }

    pub fn replace_model(&mut self, model: M) {
        self.model = model;
    }

    fn reset_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Build a clock for driving the simulation by hand (offline rendering,
    /// tests). Each run starts at idle with an empty history and nothing
    /// published from an earlier run.
    pub fn into_clock(self) -> SimulationClock<M> {
        self.reset_history();
        self.exchange.reset_state();
        let integrator = DynamicsIntegrator::new(self.model, self.params, self.config.clock.limits);
        SimulationClock::new(integrator, self.exchange, self.config.clock).with_history(self.feed)
    }

    /// Spawn the clock thread. `on_event` runs on that thread for every
    /// stall recovery and instability warning.
    pub fn start<F>(self, on_event: F) -> Result<RunningSession<M>, SessionError>
    where
        F: FnMut(&ClockEvent) + Send + 'static,
    {
        let parts = Parked {
            params: Arc::clone(&self.params),
            config: self.config.clone(),
            exchange: Arc::clone(&self.exchange),
            history: Arc::clone(&self.history),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let mut clock = self.into_clock();

        let stop_clock = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rev-clock".to_string())
            .spawn(move || {
                clock.run(&stop_clock, on_event);
                clock
            })?;

        info!("simulation clock started");
        Ok(RunningSession {
            stop,
            handle,
            parts,
        })
    }
}

struct Parked {
    params: Arc<EngineParameters>,
    config: SessionConfig,
    exchange: Arc<StateExchange>,
    history: SharedHistory,
}

pub struct RunningSession<M: TorqueModel> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<SimulationClock<M>>,
    parts: Parked,
}

impl<M: TorqueModel + 'static> RunningSession<M> {
    pub fn params(&self) -> &Arc<EngineParameters> {
        &self.parts.params
    }

    pub fn exchange(&self) -> Arc<StateExchange> {
        Arc::clone(&self.parts.exchange)
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            exchange: Arc::clone(&self.parts.exchange),
        }
    }

    pub fn history(&self) -> SharedHistory {
        Arc::clone(&self.parts.history)
    }

    pub fn synthesizer(&self, config: SynthConfig) -> AudioSynthesizer {
        AudioSynthesizer::new(Arc::clone(&self.parts.exchange), &self.parts.params, config)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Raise the stop flag, wait for the clock to finish its iteration and
    /// hand the stopped session back.
    pub fn stop(self) -> Result<(Session<M>, ClockStats), SessionError> {
        self.stop.store(true, Ordering::Relaxed);
        let clock = self.handle.join().map_err(|_| SessionError::ClockPanicked)?;
        let (integrator, feed, stats) = clock.into_parts();
        info!(
            "simulation clock stopped after {} ticks ({} stalls, {} instability excursions)",
            stats.ticks_executed, stats.stalls_recovered, stats.instability_excursions
        );

        let Parked {
            params,
            config,
            exchange,
            history,
        } = self.parts;
        let feed = match feed {
            Some(feed) => feed,
            None => {
                // The clock was built with a feed; rebuild one only if lost.
                let (feed, fresh) = history_channel(config.history_capacity(), config.feed_capacity);
                *history.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
                feed
            }
        };

        Ok((
            Session {
                params,
                model: integrator.into_model(),
                config,
                exchange,
                history,
                feed,
            },
            stats,
        ))
    }
}
