//! Audio output boundary.
//!
//! The synthesizer itself never fails; everything that can go wrong with
//! getting samples to a device lives here. Underruns are counted in an
//! atomic and picked up by the telemetry thread, since nothing may log or
//! lock inside the device callback.

use rev_core::{AudioSynthesizer, ClockEvent, SharedHistory, SimulationClock, TorqueModel};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Frames rendered per synthesizer call inside the device callback.
pub const CALLBACK_CHUNK: usize = 1024;

/// A callback arriving later than this multiple of its own block length
/// counts as an underrun.
const LATE_CALLBACK_FACTOR: f64 = 2.0;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Failed to get default audio device: {0}")]
    NoDefaultDevice(String),

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio output requires building with the 'audio' feature")]
    FeatureDisabled,

    #[error("Invalid render request: {0}")]
    InvalidRequest(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Counters shared between the device callback and the telemetry thread.
#[derive(Debug, Clone, Default)]
pub struct AudioCounters {
    underruns: Arc<AtomicU64>,
    blocks: Arc<AtomicU64>,
}

impl AudioCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg_attr(not(feature = "audio"), allow(dead_code))]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg_attr(not(feature = "audio"), allow(dead_code))]
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Everything the device callback owns. Kept free of device types so the
/// underrun policy can be exercised without hardware.
#[cfg_attr(not(feature = "audio"), allow(dead_code))]
pub struct OutputBoundary {
    synth: AudioSynthesizer,
    scratch: Vec<f32>,
    sample_rate: u32,
    counters: AudioCounters,
}

#[cfg_attr(not(feature = "audio"), allow(dead_code))]
impl OutputBoundary {
    pub fn new(synth: AudioSynthesizer, counters: AudioCounters) -> Self {
        let sample_rate = synth.config().sample_rate;
        Self {
            synth,
            scratch: vec![0.0; CALLBACK_CHUNK],
            sample_rate,
            counters,
        }
    }

    /// Fill `frames` mono samples through `write(frame_index, sample)`.
    ///
    /// `since_last` is the time since the previous callback started. If the
    /// device came back much later than the block it asked for, the gap was
    /// already audible: the underrun is counted and the block is rendered
    /// from the latest published state as usual.
    pub fn fill(
        &mut self,
        frames: usize,
        since_last: Option<Duration>,
        mut write: impl FnMut(usize, f32),
    ) {
        if let Some(gap) = since_last {
            let expected = frames as f64 / self.sample_rate as f64;
            if expected > 0.0 && gap.as_secs_f64() > expected * LATE_CALLBACK_FACTOR {
                self.counters.record_underrun();
            }
        }

        let mut offset = 0;
        while offset < frames {
            let len = (frames - offset).min(self.scratch.len());
            let frame = self.synth.render(&mut self.scratch[..len]);
            for (i, &s) in frame.samples.iter().enumerate() {
                write(offset + i, s);
            }
            offset += len;
            self.counters.record_block();
        }
    }
}

#[cfg(feature = "audio")]
pub use device::{list_output_devices, start_output, AudioOutput};

#[cfg(feature = "audio")]
mod device {
    use super::{AudioCounters, AudioError, OutputBoundary};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use rev_core::AudioSynthesizer;
    use std::time::Instant;
    use tracing::{info, warn};

    /// A playing output stream. Dropping it stops playback.
    pub struct AudioOutput {
        _stream: cpal::Stream,
        pub sample_rate: u32,
        pub channels: u16,
        pub device_name: String,
    }

    pub fn list_output_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn pick_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        if let Some(name) = name {
            let devices = host
                .output_devices()
                .map_err(|e| AudioError::ConfigError(e.to_string()))?;
            for d in devices {
                if d.name().map(|n| n == name).unwrap_or(false) {
                    return Ok(d);
                }
            }
            return Err(AudioError::DeviceNotFound(name.to_string()));
        }
        host.default_output_device()
            .ok_or_else(|| AudioError::NoDefaultDevice(host.id().name().to_string()))
    }

    /// Open the device and start playing. The synthesizer is built for the
    /// device's own sample rate by `make_synth`.
    pub fn start_output(
        device_name: Option<&str>,
        make_synth: impl FnOnce(u32) -> AudioSynthesizer,
        counters: AudioCounters,
    ) -> Result<AudioOutput, AudioError> {
        let device = pick_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::ConfigError(e.to_string()))?;
        let sample_format = supported.sample_format();
        let cfg = supported.config();

        let boundary = OutputBoundary::new(make_synth(cfg.sample_rate.0), counters);
        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &cfg, boundary)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &cfg, boundary)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &cfg, boundary)?,
            other => return Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
        };
        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        info!(
            device = %name,
            sample_rate = cfg.sample_rate.0,
            channels = cfg.channels,
            format = ?sample_format,
            "Audio output started"
        );
        Ok(AudioOutput {
            _stream: stream,
            sample_rate: cfg.sample_rate.0,
            channels: cfg.channels,
            device_name: name,
        })
    }

    fn build_stream<T>(
        device: &cpal::Device,
        cfg: &cpal::StreamConfig,
        mut boundary: OutputBoundary,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: cpal::Sample + cpal::FromSample<f32> + cpal::SizedSample + Send + 'static,
    {
        let channels = (cfg.channels as usize).max(1);
        let mut last_callback: Option<Instant> = None;

        // Stream errors arrive on the host's own thread, not the data callback.
        let err_fn = |e: cpal::StreamError| warn!(error = %e, "Audio stream error");

        device
            .build_output_stream(
                cfg,
                move |output: &mut [T], _| {
                    let now = Instant::now();
                    let since_last = last_callback.map(|t| now.duration_since(t));
                    last_callback = Some(now);

                    let frames = output.len() / channels;
                    boundary.fill(frames, since_last, |i, s| {
                        let v: T = T::from_sample(s);
                        for ch in &mut output[i * channels..(i + 1) * channels] {
                            *ch = v;
                        }
                    });
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))
    }
}

#[cfg(not(feature = "audio"))]
pub fn list_output_devices() -> Result<Vec<String>, AudioError> {
    Err(AudioError::FeatureDisabled)
}

/// What to render offline.
#[derive(Debug, Clone, Copy)]
pub struct WavPlan {
    pub seconds: f64,
    pub block_size: usize,
    /// Write 32-bit float samples instead of 16-bit integers.
    pub float_samples: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavSummary {
    pub samples: u64,
    pub blocks: u64,
    pub peak: f32,
}

/// Drive `clock` and `synth` in lockstep on simulated time and write the
/// result to a mono WAV file. Each block first advances the simulation by
/// the block's duration, then renders it, so the output is deterministic.
/// Block durations are taken from exact sample positions, so no time is
/// lost to rounding over long renders. `history`, if given, is drained
/// after every block.
pub fn render_wav<M, F>(
    path: &Path,
    clock: &mut SimulationClock<M>,
    synth: &mut AudioSynthesizer,
    history: Option<&SharedHistory>,
    plan: WavPlan,
    on_event: &mut F,
) -> Result<WavSummary, AudioError>
where
    M: TorqueModel,
    F: FnMut(&ClockEvent),
{
    if plan.block_size == 0 {
        return Err(AudioError::InvalidRequest("block size must be positive".into()));
    }
    if !plan.seconds.is_finite() || plan.seconds < 0.0 {
        return Err(AudioError::InvalidRequest(format!(
            "duration must be finite and non-negative, got {}",
            plan.seconds
        )));
    }

    let sample_rate = synth.config().sample_rate;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: if plan.float_samples { 32 } else { 16 },
        sample_format: if plan.float_samples {
            hound::SampleFormat::Float
        } else {
            hound::SampleFormat::Int
        },
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(hound::Error::IoError)?;
        }
    }
    let mut writer = hound::WavWriter::create(path, spec)?;

    let total = (plan.seconds * sample_rate as f64).round() as u64;
    let mut buf = vec![0.0f32; plan.block_size];
    let mut summary = WavSummary {
        samples: 0,
        blocks: 0,
        peak: 0.0,
    };

    let position_ns = |samples: u64| -> u128 {
        u128::from(samples) * 1_000_000_000 / u128::from(sample_rate.max(1))
    };

    while summary.samples < total {
        let len = ((total - summary.samples) as usize).min(plan.block_size);
        let elapsed_ns = position_ns(summary.samples + len as u64) - position_ns(summary.samples);
        clock.advance(
            Duration::from_nanos(u64::try_from(elapsed_ns).unwrap_or(u64::MAX)),
            on_event,
        );
        let frame = synth.render(&mut buf[..len]);
        for &s in frame.samples {
            let s = s.clamp(-1.0, 1.0);
            summary.peak = summary.peak.max(s.abs());
            if plan.float_samples {
                writer.write_sample(s)?;
            } else {
                writer.write_sample((s * i16::MAX as f32) as i16)?;
            }
        }
        summary.samples += len as u64;
        summary.blocks += 1;

        if let Some(history) = history {
            history.lock().unwrap_or_else(PoisonError::into_inner).drain();
        }
    }

    writer.finalize()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rev_core::{CurveTorqueModel, ParameterSheet, Session, SessionConfig, SynthConfig};
    use tempfile::tempdir;

    fn session() -> Session<CurveTorqueModel> {
        Session::new(ParameterSheet::inline_four(), CurveTorqueModel, SessionConfig::default())
            .unwrap()
    }

    #[test]
    fn late_callback_counts_one_underrun() {
        let s = session();
        let counters = AudioCounters::new();
        let mut boundary = OutputBoundary::new(s.synthesizer(SynthConfig::default()), counters.clone());

        let mut out = vec![1.0f32; 480];
        // 480 frames at 48 kHz is 10 ms.
        boundary.fill(480, None, |i, v| out[i] = v);
        boundary.fill(480, Some(Duration::from_millis(10)), |i, v| out[i] = v);
        assert_eq!(counters.underruns(), 0);

        boundary.fill(480, Some(Duration::from_millis(45)), |i, v| out[i] = v);
        assert_eq!(counters.underruns(), 1);
        assert_eq!(counters.blocks(), 3);
    }

    #[test]
    fn large_requests_are_split_into_chunks() {
        let s = session();
        let counters = AudioCounters::new();
        let mut boundary = OutputBoundary::new(s.synthesizer(SynthConfig::default()), counters.clone());

        let frames = CALLBACK_CHUNK * 2 + 10;
        let mut written = vec![false; frames];
        boundary.fill(frames, None, |i, _| written[i] = true);
        assert!(written.iter().all(|w| *w));
        assert_eq!(counters.blocks(), 3);
    }

    #[test]
    fn offline_render_writes_expected_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("idle.wav");

        let s = session();
        s.control().set(0.6, 0.0);
        let history = s.history();
        let mut synth = s.synthesizer(SynthConfig {
            sample_rate: 8_000,
            ..SynthConfig::default()
        });
        let mut clock = s.into_clock();
        let mut events = 0u32;
        let mut sink = |_: &ClockEvent| events += 1;

        let plan = WavPlan {
            seconds: 0.5,
            block_size: 256,
            float_samples: false,
        };
        let summary = render_wav(&path, &mut clock, &mut synth, Some(&history), plan, &mut sink).unwrap();
        assert_eq!(summary.samples, 4_000);
        assert_eq!(summary.blocks, 16);
        assert!(summary.peak > 0.0);
        assert_eq!(clock.state().tick, 500);
        assert_eq!(events, 0);
        assert_eq!(history.lock().unwrap().len() as u64, clock.state().tick);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.len(), 4_000);
    }

    #[test]
    fn blocks_longer_than_the_step_bound_still_advance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("long-blocks.wav");

        let mut config = SessionConfig::default();
        config.clock.tick_period = Duration::from_micros(100);
        config.clock.max_steps_per_iteration = 5;
        let s = Session::new(ParameterSheet::inline_four(), CurveTorqueModel, config).unwrap();
        s.control().set(1.0, 0.0);
        let history = s.history();
        let mut synth = s.synthesizer(SynthConfig::default());
        let mut clock = s.into_clock();
        let mut stalls = 0u32;
        let mut sink = |e: &ClockEvent| {
            if matches!(e, ClockEvent::StallRecovered(_)) {
                stalls += 1;
            }
        };

        // 8192 samples at 48 kHz is about 1707 ticks per block.
        let plan = WavPlan {
            seconds: 2.0,
            block_size: 8_192,
            float_samples: true,
        };
        let summary = render_wav(&path, &mut clock, &mut synth, Some(&history), plan, &mut sink).unwrap();
        assert_eq!(summary.samples, 96_000);
        assert_eq!(summary.blocks, 12);
        assert!(summary.peak > 0.0);
        assert_eq!(stalls, 0);
        assert_eq!(clock.stats().stalls_recovered, 0);
        assert_eq!(clock.state().tick, 20_000);
        assert!(clock.state().rpm > 800.0);
        assert_eq!(history.lock().unwrap().len(), 20_000);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let dir = tempdir().unwrap();
        let s = session();
        let mut synth = s.synthesizer(SynthConfig::default());
        let mut clock = s.into_clock();
        let plan = WavPlan {
            seconds: 1.0,
            block_size: 0,
            float_samples: true,
        };
        let result = render_wav(&dir.path().join("x.wav"), &mut clock, &mut synth, None, plan, &mut |_| {});
        assert!(matches!(result, Err(AudioError::InvalidRequest(_))));
    }
}
