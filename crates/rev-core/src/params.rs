//! Engine parameters.
//!
//! [`ParameterSheet`] is the raw, editable form (what a profile file or a UI
//! hands over). [`EngineParameters`] can only be obtained by validating a
//! sheet, so every component downstream works with checked values.

use crate::error::ConfigurationError;
use crate::harmonics::{HarmonicTable, Partial};
use crate::torque::{CurvePoint, TorqueCurve, RAD_PER_S_PER_RPM};
use serde::{Deserialize, Serialize};

/// Safety clamp applied to integrated RPM, as a multiple of redline.
pub const RPM_CLAMP_FACTOR: f64 = 1.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSheet {
    #[serde(default)]
    pub name: String,
    pub torque_curve: Vec<CurvePoint>,
    pub inertia_kg_m2: f64,
    pub friction_nm_s_per_rad: f64,
    pub idle_rpm: f64,
    pub redline_rpm: f64,
    pub cylinders: u32,
    /// Fraction of full throttle admitted with the pedal released.
    #[serde(default)]
    pub idle_throttle: f64,
    #[serde(default)]
    pub harmonics: Option<Vec<Partial>>,
}

impl ParameterSheet {
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// A 2.0 l inline four.
    pub fn inline_four() -> Self {
        Self {
            name: "inline-4".to_string(),
            torque_curve: vec![
                CurvePoint::new(800.0, 110.0),
                CurvePoint::new(1500.0, 135.0),
                CurvePoint::new(2500.0, 150.0),
                CurvePoint::new(3500.0, 160.0),
                CurvePoint::new(4500.0, 158.0),
                CurvePoint::new(5500.0, 148.0),
                CurvePoint::new(6500.0, 130.0),
                CurvePoint::new(7000.0, 115.0),
            ],
            inertia_kg_m2: 0.18,
            friction_nm_s_per_rad: 0.12,
            idle_rpm: 800.0,
            redline_rpm: 7000.0,
            cylinders: 4,
            idle_throttle: 0.09,
            harmonics: None,
        }
    }

    /// A 5.0 l cross-plane V8.
    pub fn v8() -> Self {
        Self {
            name: "v8".to_string(),
            torque_curve: vec![
                CurvePoint::new(600.0, 280.0),
                CurvePoint::new(1500.0, 360.0),
                CurvePoint::new(2500.0, 410.0),
                CurvePoint::new(3500.0, 430.0),
                CurvePoint::new(4500.0, 420.0),
                CurvePoint::new(5500.0, 390.0),
                CurvePoint::new(6200.0, 350.0),
            ],
            inertia_kg_m2: 0.35,
            friction_nm_s_per_rad: 0.25,
            idle_rpm: 700.0,
            redline_rpm: 6200.0,
            cylinders: 8,
            idle_throttle: 0.063,
            harmonics: None,
        }
    }
}

/// Validated, immutable engine description.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParameters {
    name: String,
    curve: TorqueCurve,
    inertia: f64,
    friction: f64,
    idle_rpm: f64,
    redline_rpm: f64,
    cylinders: u32,
    idle_throttle: f64,
    harmonics: HarmonicTable,
}

fn positive(field: &'static str, value: f64) -> Result<f64, ConfigurationError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigurationError::NonPositive { field, value })
    }
}

impl EngineParameters {
    pub fn new(sheet: ParameterSheet) -> Result<Self, ConfigurationError> {
        let curve = TorqueCurve::new(sheet.torque_curve)?;
        let inertia = positive("inertia_kg_m2", sheet.inertia_kg_m2)?;
        let friction = positive("friction_nm_s_per_rad", sheet.friction_nm_s_per_rad)?;
        let redline_rpm = positive("redline_rpm", sheet.redline_rpm)?;

        if !(sheet.idle_rpm.is_finite() && sheet.idle_rpm > 0.0 && sheet.idle_rpm < redline_rpm) {
            return Err(ConfigurationError::IdleOutsideRange {
                idle_rpm: sheet.idle_rpm,
                redline_rpm,
            });
        }
        if !(1..=16).contains(&sheet.cylinders) {
            return Err(ConfigurationError::CylinderCount {
                count: sheet.cylinders,
            });
        }
        if !(sheet.idle_throttle.is_finite() && (0.0..1.0).contains(&sheet.idle_throttle)) {
            return Err(ConfigurationError::IdleThrottle {
                value: sheet.idle_throttle,
            });
        }

        let harmonics = match sheet.harmonics {
            Some(partials) => HarmonicTable::new(partials)?,
            None => HarmonicTable::for_cylinders(sheet.cylinders),
        };

        Ok(Self {
            name: sheet.name,
            curve,
            inertia,
            friction,
            idle_rpm: sheet.idle_rpm,
            redline_rpm,
            cylinders: sheet.cylinders,
            idle_throttle: sheet.idle_throttle,
            harmonics,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        Self::new(ParameterSheet::from_json(text)?)
    }

    pub fn to_sheet(&self) -> ParameterSheet {
        ParameterSheet {
            name: self.name.clone(),
            torque_curve: self.curve.points().to_vec(),
            inertia_kg_m2: self.inertia,
            friction_nm_s_per_rad: self.friction,
            idle_rpm: self.idle_rpm,
            redline_rpm: self.redline_rpm,
            cylinders: self.cylinders,
            idle_throttle: self.idle_throttle,
            harmonics: Some(self.harmonics.partials().to_vec()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn curve(&self) -> &TorqueCurve {
        &self.curve
    }

    pub fn inertia(&self) -> f64 {
        self.inertia
    }

    pub fn friction(&self) -> f64 {
        self.friction
    }

    pub fn idle_rpm(&self) -> f64 {
        self.idle_rpm
    }

    pub fn redline_rpm(&self) -> f64 {
        self.redline_rpm
    }

    /// Hard upper bound on integrated RPM.
    pub fn max_rpm(&self) -> f64 {
        self.redline_rpm * RPM_CLAMP_FACTOR
    }

    pub fn cylinders(&self) -> u32 {
        self.cylinders
    }

    pub fn idle_throttle(&self) -> f64 {
        self.idle_throttle
    }

    pub fn harmonics(&self) -> &HarmonicTable {
        &self.harmonics
    }

    /// Peak curve torque times redline angular velocity. An upper bound on
    /// yield, used to normalise loudness.
    pub fn nominal_peak_power_w(&self) -> f64 {
        self.curve.peak_torque_nm() * self.redline_rpm * RAD_PER_S_PER_RPM
    }
}
