//! Harmonic content of the engine voice.
//!
//! Partials are expressed as ratios of the firing frequency
//! (`rpm / 60 * cylinders / 2`). The table is a session parameter: the
//! default below is a starting point derived from the cylinder count, and a
//! profile may replace it outright.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Upper bound on partials; the synthesizer preallocates this many
/// oscillators.
pub const MAX_PARTIALS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Partial {
    /// Frequency as a multiple of the firing frequency.
    pub ratio: f64,
    /// Linear amplitude before normalisation.
    pub amplitude: f64,
}

impl Partial {
    pub const fn new(ratio: f64, amplitude: f64) -> Self {
        Self { ratio, amplitude }
    }
}

const FIRING_SERIES: [f64; 6] = [1.0, 0.55, 0.35, 0.22, 0.14, 0.09];

#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicTable {
    partials: Vec<Partial>,
}

impl HarmonicTable {
    pub fn new(partials: Vec<Partial>) -> Result<Self, ConfigurationError> {
        if partials.is_empty() || partials.len() > MAX_PARTIALS {
            return Err(ConfigurationError::HarmonicTable(format!(
                "expected 1..={} partials, got {}",
                MAX_PARTIALS,
                partials.len()
            )));
        }
        for (i, p) in partials.iter().enumerate() {
            if !(p.ratio.is_finite() && p.ratio > 0.0) {
                return Err(ConfigurationError::HarmonicTable(format!(
                    "partial {i} has invalid ratio {}",
                    p.ratio
                )));
            }
            if !(p.amplitude.is_finite() && p.amplitude >= 0.0) {
                return Err(ConfigurationError::HarmonicTable(format!(
                    "partial {i} has invalid amplitude {}",
                    p.amplitude
                )));
            }
        }
        if partials.iter().all(|p| p.amplitude == 0.0) {
            return Err(ConfigurationError::HarmonicTable(
                "all partial amplitudes are zero".to_string(),
            ));
        }
        Ok(Self { partials })
    }

    /// Firing-order harmonics plus a crank-rate rumble. Odd cylinder counts
    /// (and singles/twins) fire unevenly, so they also get half-order
    /// partials between the firing harmonics.
    pub fn for_cylinders(cylinders: u32) -> Self {
        let cylinders = cylinders.max(1);
        let mut partials: Vec<Partial> = FIRING_SERIES
            .iter()
            .enumerate()
            .map(|(k, &a)| Partial::new((k + 1) as f64, a))
            .collect();

        // Once per crank revolution.
        partials.push(Partial::new(2.0 / f64::from(cylinders), 0.12));

        if cylinders % 2 == 1 || cylinders <= 2 {
            partials.push(Partial::new(0.5, 0.30));
            partials.push(Partial::new(1.5, 0.18));
            partials.push(Partial::new(2.5, 0.08));
        }

        Self { partials }
    }

    pub fn partials(&self) -> &[Partial] {
        &self.partials
    }

    /// Sum of amplitudes; used to keep the mix inside [-1, 1].
    pub fn total_amplitude(&self) -> f64 {
        self.partials.iter().map(|p| p.amplitude).sum()
    }
}

/// Firing frequency in Hz for a given speed.
#[inline]
pub fn firing_frequency_hz(rpm: f64, cylinders: u32) -> f64 {
    rpm / 60.0 * f64::from(cylinders) / 2.0
}
