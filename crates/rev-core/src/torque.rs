//! Torque models.
//!
//! A [`TorqueModel`] maps `(rpm, throttle, load)` to the torque the crank
//! produces and the net torque left over for acceleration. The default
//! [`CurveTorqueModel`] interpolates the break points of a [`TorqueCurve`];
//! alternate physical models plug in behind the same trait without touching
//! the integrator, clock or synthesizer.

use crate::error::ConfigurationError;
use crate::params::EngineParameters;
use serde::{Deserialize, Serialize};

/// Radians per second for one RPM.
pub const RAD_PER_S_PER_RPM: f64 = std::f64::consts::PI / 30.0;

#[inline]
pub fn rpm_to_rad_s(rpm: f64) -> f64 {
    rpm * RAD_PER_S_PER_RPM
}

#[inline]
pub fn rad_s_to_rpm(omega: f64) -> f64 {
    omega / RAD_PER_S_PER_RPM
}

/// One break point of a full-throttle torque curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub rpm: f64,
    pub torque_nm: f64,
}

impl CurvePoint {
    pub const fn new(rpm: f64, torque_nm: f64) -> Self {
        Self { rpm, torque_nm }
    }
}

/// Full-throttle torque as a function of RPM, validated on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TorqueCurve {
    points: Vec<CurvePoint>,
}

impl TorqueCurve {
    pub fn new(points: Vec<CurvePoint>) -> Result<Self, ConfigurationError> {
        if points.len() < 2 {
            return Err(ConfigurationError::TooFewBreakPoints {
                count: points.len(),
            });
        }
        for (index, p) in points.iter().enumerate() {
            if !p.rpm.is_finite() || p.rpm < 0.0 || !p.torque_nm.is_finite() || p.torque_nm < 0.0
            {
                return Err(ConfigurationError::InvalidBreakPoint {
                    index,
                    rpm: p.rpm,
                    torque_nm: p.torque_nm,
                });
            }
        }
        for (index, pair) in points.windows(2).enumerate() {
            if pair[1].rpm <= pair[0].rpm {
                return Err(ConfigurationError::NonIncreasingBreakPoints {
                    index: index + 1,
                    rpm: pair[1].rpm,
                    previous_rpm: pair[0].rpm,
                });
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn peak_torque_nm(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.torque_nm)
            .fold(0.0, f64::max)
    }

    /// Piecewise-linear lookup. Outside the break points the nearest end
    /// value holds.
    pub fn lookup(&self, rpm: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if !(rpm > first.rpm) {
            return first.torque_nm;
        }
        if rpm >= last.rpm {
            return last.torque_nm;
        }
        // First break point strictly above rpm; the one before it is <= rpm.
        let upper = self.points.partition_point(|p| p.rpm <= rpm);
        let lo = self.points[upper - 1];
        let hi = self.points[upper];
        let t = (rpm - lo.rpm) / (hi.rpm - lo.rpm);
        lo.torque_nm + (hi.torque_nm - lo.torque_nm) * t
    }
}

/// Torque produced for one evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Torque {
    /// Torque delivered by combustion at the crank, after the rev limiter.
    pub engine_nm: f64,
    /// Internal friction opposing rotation.
    pub friction_nm: f64,
    /// External load applied this evaluation.
    pub load_nm: f64,
    /// `engine - friction - load`; what is left to accelerate the flywheel.
    pub net_nm: f64,
}

/// Capability interface for torque production. Implementations must be
/// pure: the same inputs always give the same output.
pub trait TorqueModel: Send + Sync {
    fn torque(&self, rpm: f64, throttle: f64, load_nm: f64, params: &EngineParameters) -> Torque;

    fn name(&self) -> &str {
        "custom"
    }
}

/// Clamp a throttle request into `[0, 1]`; NaN reads as closed.
#[inline]
pub fn clamp_throttle(throttle: f64) -> f64 {
    if throttle.is_nan() {
        0.0
    } else {
        throttle.clamp(0.0, 1.0)
    }
}

/// The default model: curve lookup scaled by throttle, viscous friction,
/// and a hard fuel cut above redline.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurveTorqueModel;

impl CurveTorqueModel {
    /// Throttle after the idle air bypass is folded in.
    #[inline]
    pub fn effective_throttle(throttle: f64, params: &EngineParameters) -> f64 {
        let idle = params.idle_throttle();
        idle + (1.0 - idle) * clamp_throttle(throttle)
    }
}

impl TorqueModel for CurveTorqueModel {
    fn torque(&self, rpm: f64, throttle: f64, load_nm: f64, params: &EngineParameters) -> Torque {
        let rpm = if rpm.is_finite() { rpm.max(0.0) } else { 0.0 };
        let load_nm = if load_nm.is_finite() { load_nm.max(0.0) } else { 0.0 };

        let engine_nm = if rpm > params.redline_rpm() {
            0.0
        } else {
            params.curve().lookup(rpm) * Self::effective_throttle(throttle, params)
        };
        let friction_nm = params.friction() * rpm_to_rad_s(rpm);

        Torque {
            engine_nm,
            friction_nm,
            load_nm,
            net_nm: engine_nm - friction_nm - load_nm,
        }
    }

    fn name(&self) -> &str {
        "curve"
    }
}
