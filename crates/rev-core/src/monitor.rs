use crate::integrator::StepOutcome;
use log::{info, warn};
use thiserror::Error;

/// The integrator had to clamp acceleration to stay bounded. Non-fatal; the
/// simulation keeps running on the clamped value.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("numerical instability at tick {tick}: requested acceleration {requested_acceleration} rad/s² clamped to ±{limit} rad/s²")]
pub struct NumericalInstabilityWarning {
    pub tick: u64,
    pub requested_acceleration: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StabilityState {
    #[default]
    Stable,
    Clamping,
}

/// Turns per-tick clamp flags into one warning per excursion.
#[derive(Debug, Default)]
pub struct InstabilityMonitor {
    state: StabilityState,
    excursions: u64,
    clamped_ticks: u64,
    excursion_started_at: u64,
}

impl InstabilityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StabilityState {
        self.state
    }

    pub fn excursions(&self) -> u64 {
        self.excursions
    }

    pub fn clamped_ticks(&self) -> u64 {
        self.clamped_ticks
    }

    pub fn observe(
        &mut self,
        outcome: &StepOutcome,
        limit: f64,
    ) -> Option<NumericalInstabilityWarning> {
        let tick = outcome.state.tick;
        match (self.state, outcome.acceleration_clamped) {
            (StabilityState::Stable, true) => {
                self.state = StabilityState::Clamping;
                self.excursions += 1;
                self.clamped_ticks += 1;
                self.excursion_started_at = tick;
                let warning = NumericalInstabilityWarning {
                    tick,
                    requested_acceleration: outcome.requested_acceleration,
                    limit,
                };
                warn!("{warning}");
                Some(warning)
            }
            (StabilityState::Clamping, true) => {
                self.clamped_ticks += 1;
                None
            }
            (StabilityState::Clamping, false) => {
                self.state = StabilityState::Stable;
                info!(
                    "acceleration back within limits at tick {tick} after {} clamped ticks",
                    tick.saturating_sub(self.excursion_started_at)
                );
                None
            }
            (StabilityState::Stable, false) => None,
        }
    }
}
