use serde::{Deserialize, Serialize};

/// One simulation tick's worth of engine state. Produced once per tick and
/// never modified after it is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub tick: u64,
    pub rpm: f64,
    /// Torque delivered by combustion at the crank.
    pub torque_nm: f64,
    pub angular_acceleration: f64,
    /// Instantaneous power, torque times angular velocity.
    pub yield_w: f64,
}

impl EngineState {
    /// Resting state before the first tick: the engine sits at `rpm`.
    pub fn at_rest(rpm: f64) -> Self {
        Self {
            tick: 0,
            rpm,
            torque_nm: 0.0,
            angular_acceleration: 0.0,
            yield_w: 0.0,
        }
    }
}

/// Operator input, updated asynchronously and sampled once per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlInput {
    pub throttle: f64,
    pub load_torque_nm: f64,
}

impl ControlInput {
    pub fn new(throttle: f64, load_torque_nm: f64) -> Self {
        Self {
            throttle,
            load_torque_nm,
        }
    }

    /// Bring the input inside the ranges the integrator accepts.
    pub fn sanitized(self, limits: &SimulationLimits) -> Self {
        let throttle = if self.throttle.is_nan() {
            0.0
        } else {
            self.throttle.clamp(0.0, 1.0)
        };
        let load_torque_nm = if self.load_torque_nm.is_nan() {
            0.0
        } else {
            self.load_torque_nm.clamp(0.0, limits.max_load_torque_nm)
        };
        Self {
            throttle,
            load_torque_nm,
        }
    }
}

/// Bounds that keep the integrator numerically well behaved regardless of
/// what the parameters or inputs ask for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationLimits {
    pub max_load_torque_nm: f64,
    /// rad/s²
    pub max_angular_acceleration: f64,
}

impl Default for SimulationLimits {
    fn default() -> Self {
        Self {
            max_load_torque_nm: 2_000.0,
            max_angular_acceleration: 50_000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_and_zeroes_nan() {
        let limits = SimulationLimits::default();
        let c = ControlInput::new(1.7, 1e9).sanitized(&limits);
        assert_eq!(c.throttle, 1.0);
        assert_eq!(c.load_torque_nm, limits.max_load_torque_nm);

        let c = ControlInput::new(f64::NAN, -5.0).sanitized(&limits);
        assert_eq!(c.throttle, 0.0);
        assert_eq!(c.load_torque_nm, 0.0);

        let c = ControlInput::new(0.5, f64::NAN).sanitized(&limits);
        assert_eq!(c.load_torque_nm, 0.0);
    }
}
