//! Additive engine voice, driven from the state exchange.
//!
//! The synthesizer runs on the audio thread. Everything it needs is sized in
//! [`AudioSynthesizer::new`]; `render` only reads the exchange (wait-free),
//! does arithmetic on fixed arrays and writes into the caller's buffer.
//!
//! Physics publishes at the tick rate while audio pulls blocks at the
//! sample rate, so each block sweeps RPM linearly from where the previous
//! block ended to the newest published state. Oscillator phases are never
//! reset, only wrapped.

use crate::harmonics::{firing_frequency_hz, MAX_PARTIALS};
use crate::params::EngineParameters;
use crate::state::EngineState;
use crate::sync::StateExchange;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

/// Partials above this fraction of the sample rate are muted.
pub const ALIAS_GUARD: f64 = 0.45;

#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub sample_rate: u32,
    /// No new publish for this long means the simulation is considered
    /// stalled and the voice fades out.
    pub stall_timeout: Duration,
    /// Length of the gain ramp used for fade-in, stall fade-out and recovery.
    pub fade_time: Duration,
    pub master_gain: f32,
    /// Loudness at zero yield, as a fraction of full intensity.
    pub intensity_floor: f64,
    /// Share of the drive taken from produced torque rather than yield.
    pub torque_weight: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            stall_timeout: Duration::from_millis(100),
            fade_time: Duration::from_millis(50),
            master_gain: 0.5,
            intensity_floor: 0.25,
            torque_weight: 0.35,
        }
    }
}

/// Parameters a block was rendered with. Values are linear across the block
/// from `*_start` (sample 0) towards `*_end` (reached at sample `len`).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockInterpolation {
    pub rpm_start: f64,
    pub rpm_end: f64,
    pub intensity_start: f64,
    pub intensity_end: f64,
    pub gain_start: f64,
    pub gain_end: f64,
    pub source_tick: u64,
    pub source_sequence: u64,
    pub cylinders: u32,
    pub len: usize,
    /// False until the first state has been published; the block is silent.
    pub has_state: bool,
}

impl BlockInterpolation {
    fn fraction(&self, sample: usize) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            sample as f64 / self.len as f64
        }
    }

    pub fn rpm_at(&self, sample: usize) -> f64 {
        let t = self.fraction(sample);
        self.rpm_start + (self.rpm_end - self.rpm_start) * t
    }

    pub fn intensity_at(&self, sample: usize) -> f64 {
        let t = self.fraction(sample);
        self.intensity_start + (self.intensity_end - self.intensity_start) * t
    }

    /// Firing frequency the oscillators were driven at for `sample`.
    pub fn frequency_at(&self, sample: usize) -> f64 {
        firing_frequency_hz(self.rpm_at(sample), self.cylinders)
    }
}

/// One rendered block. Borrowed from the output buffer; handed to the device
/// and not retained.
#[derive(Debug)]
pub struct AudioFrame<'a> {
    pub samples: &'a [f32],
    pub interpolation: BlockInterpolation,
}

pub struct AudioSynthesizer {
    exchange: Arc<StateExchange>,
    config: SynthConfig,
    cylinders: u32,
    ratios: [f64; MAX_PARTIALS],
    amplitudes: [f64; MAX_PARTIALS],
    phases: [f64; MAX_PARTIALS],
    partial_count: usize,
    normalisation: f64,
    nominal_power_w: f64,
    peak_torque_nm: f64,
    alias_limit_hz: f64,
    stall_samples: u64,
    gain_step: f64,
    gain: f64,
    last_end: Option<(f64, f64)>,
    last_sequence: u64,
    samples_since_publish: u64,
}

impl AudioSynthesizer {
    pub fn new(exchange: Arc<StateExchange>, params: &EngineParameters, config: SynthConfig) -> Self {
        let table = params.harmonics();
        let mut ratios = [0.0; MAX_PARTIALS];
        let mut amplitudes = [0.0; MAX_PARTIALS];
        let partial_count = table.partials().len().min(MAX_PARTIALS);
        for (i, partial) in table.partials().iter().take(partial_count).enumerate() {
            ratios[i] = partial.ratio;
            amplitudes[i] = partial.amplitude;
        }
        let total = table.total_amplitude();

        let sample_rate = f64::from(config.sample_rate.max(1));
        let fade_samples = config.fade_time.as_secs_f64() * sample_rate;
        let gain_step = if fade_samples >= 1.0 {
            1.0 / fade_samples
        } else {
            1.0
        };

        Self {
            exchange,
            cylinders: params.cylinders(),
            ratios,
            amplitudes,
            phases: [0.0; MAX_PARTIALS],
            partial_count,
            normalisation: if total > 0.0 { 1.0 / total } else { 0.0 },
            nominal_power_w: params.nominal_peak_power_w(),
            peak_torque_nm: params.curve().peak_torque_nm(),
            alias_limit_hz: ALIAS_GUARD * sample_rate,
            stall_samples: (config.stall_timeout.as_secs_f64() * sample_rate).ceil() as u64,
            gain_step,
            gain: 0.0,
            last_end: None,
            last_sequence: 0,
            samples_since_publish: 0,
            config,
        }
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    /// Current output gain in [0, 1].
    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn is_stalled(&self) -> bool {
        self.last_sequence != 0 && self.samples_since_publish >= self.stall_samples
    }

    /// Loudness for a state, in [floor, 1].
    pub fn intensity(&self, state: &EngineState) -> f64 {
        let share = |value: f64, full: f64| {
            if full > 0.0 && value.is_finite() {
                (value / full).clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        let w = self.config.torque_weight.clamp(0.0, 1.0);
        let drive = (1.0 - w) * share(state.yield_w, self.nominal_power_w)
            + w * share(state.torque_nm, self.peak_torque_nm);
        let floor = self.config.intensity_floor.clamp(0.0, 1.0);
        floor + (1.0 - floor) * drive
    }

    /// Fill `out` completely. Never blocks and never allocates.
    pub fn render<'a>(&mut self, out: &'a mut [f32]) -> AudioFrame<'a> {
        let len = out.len();
        let Some(pair) = self.exchange.latest_pair() else {
            out.fill(0.0);
            return AudioFrame {
                samples: out,
                interpolation: BlockInterpolation {
                    cylinders: self.cylinders,
                    len,
                    ..BlockInterpolation::default()
                },
            };
        };

        if pair.sequence != self.last_sequence {
            self.last_sequence = pair.sequence;
            self.samples_since_publish = 0;
        }
        let target_gain = if self.samples_since_publish >= self.stall_samples {
            0.0
        } else {
            1.0
        };

        let (rpm_start, intensity_start) = self
            .last_end
            .unwrap_or_else(|| (pair.previous.rpm, self.intensity(&pair.previous)));
        let rpm_end = pair.current.rpm;
        let intensity_end = self.intensity(&pair.current);
        let gain_start = self.gain;

        let sample_period = 1.0 / f64::from(self.config.sample_rate.max(1));
        let master = f64::from(self.config.master_gain);
        let n = len.max(1) as f64;

        for (i, sample) in out.iter_mut().enumerate() {
            let t = i as f64 / n;
            let rpm = rpm_start + (rpm_end - rpm_start) * t;
            let intensity = intensity_start + (intensity_end - intensity_start) * t;
            let fundamental = firing_frequency_hz(rpm, self.cylinders);

            let mut mix = 0.0;
            for k in 0..self.partial_count {
                let freq = fundamental * self.ratios[k];
                if freq < self.alias_limit_hz {
                    mix += self.amplitudes[k] * self.phases[k].sin();
                }
                // Muted partials keep turning so they re-enter in phase.
                self.phases[k] += TAU * freq * sample_period;
                if self.phases[k] >= TAU {
                    self.phases[k] = self.phases[k].rem_euclid(TAU);
                }
            }

            *sample = (mix * self.normalisation * intensity * self.gain * master) as f32;

            if self.gain < target_gain {
                self.gain = (self.gain + self.gain_step).min(target_gain);
            } else if self.gain > target_gain {
                self.gain = (self.gain - self.gain_step).max(target_gain);
            }
        }

        self.samples_since_publish = self.samples_since_publish.saturating_add(len as u64);
        self.last_end = Some((rpm_end, intensity_end));

        AudioFrame {
            samples: out,
            interpolation: BlockInterpolation {
                rpm_start,
                rpm_end,
                intensity_start,
                intensity_end,
                gain_start,
                gain_end: self.gain,
                source_tick: pair.current.tick,
                source_sequence: pair.sequence,
                cylinders: self.cylinders,
                len,
                has_state: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harmonics::Partial;
    use crate::params::ParameterSheet;

    fn params(harmonics: Option<Vec<Partial>>) -> EngineParameters {
        let mut sheet = ParameterSheet::inline_four();
        sheet.harmonics = harmonics;
        EngineParameters::new(sheet).unwrap()
    }

    fn state(tick: u64, rpm: f64) -> EngineState {
        EngineState {
            tick,
            rpm,
            torque_nm: 120.0,
            angular_acceleration: 0.0,
            yield_w: 120.0 * rpm * std::f64::consts::PI / 30.0,
        }
    }

    #[test]
    fn silent_before_first_publish() {
        let exchange = Arc::new(StateExchange::new());
        let mut synth = AudioSynthesizer::new(exchange, &params(None), SynthConfig::default());
        let mut buf = vec![1.0f32; 512];
        let frame = synth.render(&mut buf);
        assert!(!frame.interpolation.has_state);
        assert!(frame.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn fills_exactly_the_requested_length() {
        let exchange = Arc::new(StateExchange::new());
        exchange.publish_state(state(1, 3000.0));
        let mut synth = AudioSynthesizer::new(exchange, &params(None), SynthConfig::default());
        for len in [0usize, 1, 64, 441, 1024] {
            let mut buf = vec![f32::NAN; len];
            let frame = synth.render(&mut buf);
            assert_eq!(frame.samples.len(), len);
            assert!(frame.samples.iter().all(|s| s.is_finite()));
        }
    }

    #[test]
    fn midpoint_frequency_matches_midpoint_rpm() {
        let exchange = Arc::new(StateExchange::new());
        exchange.publish_state(state(1, 2000.0));
        exchange.publish_state(state(2, 2200.0));
        let p = params(None);
        let mut synth = AudioSynthesizer::new(exchange, &p, SynthConfig::default());

        let mut buf = vec![0.0f32; 480];
        let frame = synth.render(&mut buf);
        let interp = frame.interpolation;
        assert_eq!(interp.rpm_start, 2000.0);
        assert_eq!(interp.rpm_end, 2200.0);
        let expected = firing_frequency_hz(2100.0, p.cylinders());
        assert!((interp.frequency_at(240) - expected).abs() < 1e-9);
        assert!((interp.rpm_at(240) - 2100.0).abs() < 1e-9);
    }

    #[test]
    fn next_block_starts_where_the_last_ended() {
        let exchange = Arc::new(StateExchange::new());
        exchange.publish_state(state(1, 2000.0));
        exchange.publish_state(state(2, 2200.0));
        let mut synth =
            AudioSynthesizer::new(Arc::clone(&exchange), &params(None), SynthConfig::default());
        let mut buf = vec![0.0f32; 256];
        synth.render(&mut buf);

        exchange.publish_state(state(3, 2300.0));
        let frame = synth.render(&mut buf);
        assert_eq!(frame.interpolation.rpm_start, 2200.0);
        assert_eq!(frame.interpolation.rpm_end, 2300.0);
    }

    #[test]
    fn phase_is_continuous_across_blocks() {
        // A single partial: sample-to-sample change is bounded by the
        // amplitude times the per-sample phase increment.
        let exchange = Arc::new(StateExchange::new());
        let config = SynthConfig::default();
        let p = params(Some(vec![Partial::new(1.0, 1.0)]));
        let mut synth = AudioSynthesizer::new(Arc::clone(&exchange), &p, config.clone());

        let rpm = 3000.0;
        let mut tick = 0;
        let mut publish = {
            let exchange = Arc::clone(&exchange);
            move || {
                tick += 1;
                exchange.publish_state(state(tick, rpm));
            }
        };

        // Let the fade-in finish.
        let mut warmup = vec![0.0f32; 512];
        for _ in 0..8 {
            publish();
            synth.render(&mut warmup);
        }
        assert_eq!(synth.gain(), 1.0);

        let mut signal = Vec::new();
        for len in [128usize, 333, 64, 500, 1, 256] {
            publish();
            let mut buf = vec![0.0f32; len];
            let frame = synth.render(&mut buf);
            signal.extend_from_slice(frame.samples);
        }

        let steady = state(0, rpm);
        let peak = synth.intensity(&steady) * f64::from(config.master_gain);
        let increment = TAU * firing_frequency_hz(rpm, p.cylinders()) / f64::from(config.sample_rate);
        let bound = peak * increment + 1e-5;
        for pair in signal.windows(2) {
            let jump = f64::from((pair[1] - pair[0]).abs());
            assert!(jump <= bound, "jump {jump} exceeds {bound}");
        }
    }

    #[test]
    fn fades_out_on_stall_and_back_in() {
        let exchange = Arc::new(StateExchange::new());
        let config = SynthConfig {
            stall_timeout: Duration::from_millis(20),
            fade_time: Duration::from_millis(5),
            ..SynthConfig::default()
        };
        let mut synth = AudioSynthesizer::new(Arc::clone(&exchange), &params(None), config);
        exchange.publish_state(state(1, 3000.0));

        // 240 samples is one fade length at 48 kHz; the timeout is 960.
        let mut buf = vec![0.0f32; 240];
        for _ in 0..2 {
            synth.render(&mut buf);
        }
        assert!(!synth.is_stalled());
        assert_eq!(synth.gain(), 1.0);

        // No new publishes: after the timeout the gain ramps to zero.
        let mut last = BlockInterpolation::default();
        for _ in 0..5 {
            last = synth.render(&mut buf).interpolation;
        }
        assert!(synth.is_stalled());
        assert_eq!(last.gain_end, 0.0);
        assert!(buf.iter().all(|&s| s == 0.0));

        exchange.publish_state(state(2, 3000.0));
        let frame = synth.render(&mut buf);
        assert_eq!(frame.interpolation.gain_start, 0.0);
        assert!(frame.interpolation.gain_end > 0.0);
        assert!(!synth.is_stalled());
    }

    #[test]
    fn partials_near_nyquist_are_muted() {
        let exchange = Arc::new(StateExchange::new());
        exchange.publish_state(state(1, 6000.0));
        let config = SynthConfig {
            sample_rate: 8_000,
            fade_time: Duration::ZERO,
            ..SynthConfig::default()
        };
        // 6000 rpm, 4 cylinders: 200 Hz firing; ratio 20 puts the only
        // partial at 4 kHz, above 0.45 * 8 kHz.
        let mut synth =
            AudioSynthesizer::new(exchange, &params(Some(vec![Partial::new(20.0, 1.0)])), config);
        let mut buf = vec![1.0f32; 256];
        synth.render(&mut buf);
        assert_eq!(synth.gain(), 1.0);
        let frame = synth.render(&mut buf);
        assert!(frame.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn output_stays_within_master_gain() {
        let exchange = Arc::new(StateExchange::new());
        let config = SynthConfig::default();
        let master = config.master_gain;
        let mut synth = AudioSynthesizer::new(Arc::clone(&exchange), &params(None), config);
        let mut buf = vec![0.0f32; 1024];
        for tick in 1..20 {
            exchange.publish_state(state(tick, 1000.0 + 300.0 * tick as f64));
            let frame = synth.render(&mut buf);
            assert!(frame.samples.iter().all(|s| s.abs() <= master + 1e-6));
        }
    }

    #[test]
    fn intensity_tracks_yield() {
        let exchange = Arc::new(StateExchange::new());
        let p = params(None);
        let synth = AudioSynthesizer::new(exchange, &p, SynthConfig::default());
        let quiet = synth.intensity(&EngineState::at_rest(800.0));
        let loud = synth.intensity(&state(1, 5000.0));
        assert_eq!(quiet, SynthConfig::default().intensity_floor);
        assert!(loud > quiet && loud <= 1.0);
    }
}
