//! Rotational dynamics of the crank.
//!
//! Semi-implicit Euler: net torque is evaluated at the current speed, the
//! angular velocity is advanced first, and the reported RPM and yield come
//! from the *updated* velocity. At millisecond steps this keeps the flywheel
//! from slowly gaining energy, which would be heard as pitch creep.

use crate::params::EngineParameters;
use crate::state::{ControlInput, EngineState, SimulationLimits};
use crate::torque::{rad_s_to_rpm, rpm_to_rad_s, CurveTorqueModel, Torque, TorqueModel};
use std::sync::Arc;

/// Result of one integration step, with the guards that engaged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub state: EngineState,
    pub torque: Torque,
    /// Acceleration the model asked for before clamping; NaN when the model
    /// produced a non-finite torque.
    pub requested_acceleration: f64,
    pub acceleration_clamped: bool,
    pub rpm_clamped: bool,
}

pub struct DynamicsIntegrator<M: TorqueModel = CurveTorqueModel> {
    model: M,
    params: Arc<EngineParameters>,
    limits: SimulationLimits,
}

impl<M: TorqueModel> DynamicsIntegrator<M> {
    pub fn new(model: M, params: Arc<EngineParameters>, limits: SimulationLimits) -> Self {
        Self {
            model,
            params,
            limits,
        }
    }

    pub fn params(&self) -> &EngineParameters {
        &self.params
    }

    pub fn limits(&self) -> &SimulationLimits {
        &self.limits
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// State the engine starts from: idle speed, nothing accelerating.
    pub fn initial_state(&self) -> EngineState {
        EngineState::at_rest(self.params.idle_rpm())
    }

    /// Advance `state` by `dt_s` seconds.
    pub fn step(&self, state: &EngineState, control: ControlInput, dt_s: f64) -> StepOutcome {
        let control = control.sanitized(&self.limits);
        let max_rpm = self.params.max_rpm();
        let current_rpm = if state.rpm.is_finite() {
            state.rpm.clamp(0.0, max_rpm)
        } else {
            0.0
        };

        let torque = self.model.torque(
            current_rpm,
            control.throttle,
            control.load_torque_nm,
            &self.params,
        );

        let requested = torque.net_nm / self.params.inertia();
        let limit = self.limits.max_angular_acceleration;
        let (alpha, acceleration_clamped) = if !requested.is_finite() {
            (0.0, true)
        } else if requested.abs() > limit {
            (limit.copysign(requested), true)
        } else {
            (requested, false)
        };

        let omega = rpm_to_rad_s(current_rpm) + alpha * dt_s;
        let unclamped_rpm = rad_s_to_rpm(omega);
        let rpm = if unclamped_rpm.is_finite() {
            unclamped_rpm.clamp(0.0, max_rpm)
        } else {
            current_rpm
        };
        let rpm_clamped = rpm != unclamped_rpm;

        let engine_nm = if torque.engine_nm.is_finite() {
            torque.engine_nm
        } else {
            0.0
        };

        StepOutcome {
            state: EngineState {
                tick: state.tick.wrapping_add(1),
                rpm,
                torque_nm: engine_nm,
                angular_acceleration: alpha,
                yield_w: engine_nm * rpm_to_rad_s(rpm),
            },
            torque,
            requested_acceleration: requested,
            acceleration_clamped,
            rpm_clamped,
        }
    }
}

impl TorqueModel for Box<dyn TorqueModel> {
    fn torque(&self, rpm: f64, throttle: f64, load_nm: f64, params: &EngineParameters) -> Torque {
        (**self).torque(rpm, throttle, load_nm, params)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
