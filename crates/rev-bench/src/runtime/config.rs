use rev_core::{ClockConfig, ParameterSheet, SessionConfig, SynthConfig};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing value for {flag}")]
    MissingValue { flag: String },

    #[error("invalid value {value:?} for {flag}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },

    #[error("unknown option {0}")]
    UnknownOption(String),

    #[error("failed to read engine profile {path}: {source}")]
    ProfileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine profile {path}: {source}")]
    Profile {
        path: PathBuf,
        #[source]
        source: rev_core::ConfigurationError,
    },
}

/// Where the engine parameters come from.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSource {
    InlineFour,
    V8,
    File(PathBuf),
}

impl EngineSource {
    fn parse(value: &str) -> Self {
        match value {
            "inline4" | "inline-4" | "i4" => Self::InlineFour,
            "v8" => Self::V8,
            path => Self::File(PathBuf::from(path)),
        }
    }

    pub fn load(&self) -> Result<ParameterSheet, ConfigError> {
        match self {
            Self::InlineFour => Ok(ParameterSheet::inline_four()),
            Self::V8 => Ok(ParameterSheet::v8()),
            Self::File(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ProfileRead {
                    path: path.clone(),
                    source,
                })?;
                ParameterSheet::from_json(&text).map_err(|source| ConfigError::Profile {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub list_devices: bool,
    pub engine: EngineSource,
    pub run_seconds: Option<f64>,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub bridge_require_handshake: bool,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub journal_path: Option<PathBuf>,
    pub export_csv: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
    pub wav_path: Option<PathBuf>,
    pub wav_float: bool,
    pub sample_rate: u32,
    pub block_size: usize,
    pub audio_enabled: bool,
    pub audio_device: Option<String>,
    pub throttle: f64,
    pub load_torque_nm: f64,
    pub tick_us: u64,
    pub max_steps: u32,
    pub history_seconds: f64,
}

/// Offline renders without `--run-seconds` last this long.
pub const DEFAULT_WAV_SECONDS: f64 = 5.0;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            list_devices: false,
            engine: EngineSource::InlineFour,
            run_seconds: None,
            bind_addr: "127.0.0.1:7000".to_string(),
            bridge_enabled: true,
            bridge_require_handshake: false,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            journal_path: None,
            export_csv: None,
            export_json: None,
            wav_path: None,
            wav_float: false,
            sample_rate: 48_000,
            block_size: 512,
            audio_enabled: false,
            audio_device: None,
            throttle: 0.0,
            load_torque_nm: 0.0,
            tick_us: 1_000,
            max_steps: 100,
            history_seconds: 10.0,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue {
            flag: args[i].clone(),
        })
}

fn number<T>(args: &[String], i: usize) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = value(args, i)?;
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        flag: args[i].clone(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn positive<T>(args: &[String], i: usize) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
{
    let n: T = number(args, i)?;
    if n > T::default() {
        Ok(n)
    } else {
        Err(ConfigError::InvalidValue {
            flag: args[i].clone(),
            value: args[i + 1].clone(),
            reason: "must be positive".to_string(),
        })
    }
}

fn seconds(args: &[String], i: usize) -> Result<f64, ConfigError> {
    let n = positive::<f64>(args, i)?;
    if n.is_finite() {
        Ok(n)
    } else {
        Err(ConfigError::InvalidValue {
            flag: args[i].clone(),
            value: args[i + 1].clone(),
            reason: "must be finite".to_string(),
        })
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Parse `args` (including the program name at index 0).
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--engine" => {
                    cfg.engine = EngineSource::parse(value(args, i)?);
                    i += 1;
                }
                "--run-seconds" => {
                    cfg.run_seconds = Some(seconds(args, i)?);
                    i += 1;
                }
                "--bind" => {
                    cfg.bind_addr = value(args, i)?.to_string();
                    i += 1;
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--require-handshake" => {
                    cfg.bridge_require_handshake = true;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, i)?));
                    i += 1;
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, i)?.to_string());
                    i += 1;
                }
                "--journal" => {
                    cfg.journal_path = Some(PathBuf::from(value(args, i)?));
                    i += 1;
                }
                "--export-csv" => {
                    cfg.export_csv = Some(PathBuf::from(value(args, i)?));
                    i += 1;
                }
                "--export-json" => {
                    cfg.export_json = Some(PathBuf::from(value(args, i)?));
                    i += 1;
                }
                "--wav" => {
                    cfg.wav_path = Some(PathBuf::from(value(args, i)?));
                    i += 1;
                }
                "--wav-float" => {
                    cfg.wav_float = true;
                }
                "--sample-rate" => {
                    cfg.sample_rate = positive::<u32>(args, i)?;
                    i += 1;
                }
                "--block-size" => {
                    cfg.block_size = positive::<usize>(args, i)?;
                    i += 1;
                }
                "--audio" => {
                    cfg.audio_enabled = true;
                }
                "--device" => {
                    cfg.audio_device = Some(value(args, i)?.to_string());
                    i += 1;
                }
                "--list-devices" => {
                    cfg.list_devices = true;
                }
                "--throttle" => {
                    cfg.throttle = number::<f64>(args, i)?;
                    i += 1;
                }
                "--load" => {
                    cfg.load_torque_nm = number::<f64>(args, i)?;
                    i += 1;
                }
                "--tick-us" => {
                    cfg.tick_us = positive::<u64>(args, i)?;
                    i += 1;
                }
                "--max-steps" => {
                    cfg.max_steps = positive::<u32>(args, i)?;
                    i += 1;
                }
                "--history-seconds" => {
                    cfg.history_seconds = seconds(args, i)?;
                    i += 1;
                }
                "-h" | "--help" => {
                    cfg.show_help = true;
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
            i += 1;
        }
        Ok(cfg)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            clock: ClockConfig {
                tick_period: Duration::from_micros(self.tick_us),
                max_steps_per_iteration: self.max_steps,
                ..ClockConfig::default()
            },
            history_seconds: self.history_seconds,
            ..SessionConfig::default()
        }
    }

    pub fn synth_config(&self, sample_rate: u32) -> SynthConfig {
        SynthConfig {
            sample_rate,
            ..SynthConfig::default()
        }
    }

    pub fn wav_seconds(&self) -> f64 {
        self.run_seconds.unwrap_or(DEFAULT_WAV_SECONDS)
    }

    pub fn print_help() {
        println!(
            r#"rev-bench - Engine dynamics simulator with real-time audio synthesis

USAGE:
    rev-bench [OPTIONS]

OPTIONS:
    --engine <NAME|PATH>    Engine profile: inline4, v8 or a JSON parameter sheet such as
                            profiles/single.json [default: inline4]
    --run-seconds <SECS>    Run for a fixed duration then exit (also the length of --wav renders)
    --bind <ADDR>           Bridge TCP bind address [default: 127.0.0.1:7000]
    --no-bridge             Disable the TCP control bridge
    --require-handshake     Require a hello message before accepting control
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write daily-rolling log files to this directory
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --journal <PATH>        Append session events to a JSONL journal
    --export-csv <PATH>     Write the retained state history as CSV on shutdown
    --export-json <PATH>    Write the retained state history as JSON Lines on shutdown
    --wav <PATH>            Render offline to a WAV file instead of running in real time
    --wav-float             Write 32-bit float WAV samples [default: 16-bit integer]
    --sample-rate <HZ>      Sample rate for offline rendering [default: 48000]
    --block-size <FRAMES>   Block size for offline rendering [default: 512]
    --audio                 Play through the audio device (requires 'audio' feature)
    --device <NAME>         Output device name [default: system default]
    --list-devices          List output devices and exit (requires 'audio' feature)
    --throttle <0..1>       Initial throttle [default: 0]
    --load <NM>             Initial external load torque [default: 0]
    --tick-us <US>          Simulation tick period in microseconds [default: 1000]
    --max-steps <N>         Steps per clock iteration before a stall is declared [default: 100]
    --history-seconds <S>   Length of the retained history window [default: 10]
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,rev_core=trace)

EXAMPLES:
    # Listen for control on the default port and expose metrics
    rev-bench --engine v8 --metrics-addr 0.0.0.0:9090

    # Ten-second run that keeps a journal and exports the history
    rev-bench --run-seconds 10 --no-bridge --throttle 0.4 --journal run.jsonl --export-csv run.csv

    # Offline render at full throttle
    rev-bench --wav rev.wav --run-seconds 8 --throttle 1.0
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("rev-bench")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let cfg = RuntimeConfig::from_args(&args(&[])).unwrap();
        assert_eq!(cfg.engine, EngineSource::InlineFour);
        assert!(cfg.bridge_enabled);
        assert_eq!(cfg.run_seconds, None);
        assert_eq!(cfg.session_config().clock.tick_period, Duration::from_millis(1));
        assert_eq!(cfg.session_config().history_capacity(), 10_000);
    }

    #[test]
    fn parses_runtime_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--engine", "v8", "--run-seconds", "2.5", "--no-bridge", "--throttle", "0.4",
            "--load", "30", "--tick-us", "500", "--max-steps", "50", "--export-csv", "out.csv",
            "--journal", "j.jsonl", "--json-logs",
        ]))
        .unwrap();
        assert_eq!(cfg.engine, EngineSource::V8);
        assert_eq!(cfg.run_seconds, Some(2.5));
        assert!(!cfg.bridge_enabled);
        assert_eq!(cfg.throttle, 0.4);
        assert_eq!(cfg.load_torque_nm, 30.0);
        assert!(cfg.json_logs);
        assert_eq!(cfg.export_csv, Some(PathBuf::from("out.csv")));

        let session = cfg.session_config();
        assert_eq!(session.clock.tick_period, Duration::from_micros(500));
        assert_eq!(session.clock.max_steps_per_iteration, 50);
    }

    #[test]
    fn render_flags_combine_into_a_working_offline_run() {
        use crate::audio::{render_wav, WavPlan};
        use rev_core::{ClockEvent, CurveTorqueModel, Session};

        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("fine.wav");
        let cfg = RuntimeConfig::from_args(&args(&[
            "--sample-rate", "48000", "--block-size", "8192", "--tick-us", "100",
            "--max-steps", "5", "--run-seconds", "1", "--throttle", "0.8", "--wav",
            wav.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(cfg.block_size, 8_192);
        assert_eq!(cfg.wav_path.as_deref(), Some(wav.as_path()));

        let session = Session::new(cfg.engine.load().unwrap(), CurveTorqueModel, cfg.session_config()).unwrap();
        session.control().set(cfg.throttle, cfg.load_torque_nm);
        let mut synth = session.synthesizer(cfg.synth_config(cfg.sample_rate));
        let mut clock = session.into_clock();
        let plan = WavPlan {
            seconds: cfg.wav_seconds(),
            block_size: cfg.block_size,
            float_samples: cfg.wav_float,
        };
        let summary = render_wav(&wav, &mut clock, &mut synth, None, plan, &mut |_: &ClockEvent| {}).unwrap();

        assert_eq!(summary.samples, 48_000);
        assert_eq!(clock.state().tick, 10_000);
        assert_eq!(clock.stats().stalls_recovered, 0);
        assert!(summary.peak > 0.0);
    }

    #[test]
    fn engine_path_falls_through_to_file() {
        let cfg = RuntimeConfig::from_args(&args(&["--engine", "profiles/custom.json"])).unwrap();
        assert_eq!(cfg.engine, EngineSource::File(PathBuf::from("profiles/custom.json")));
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--tick-us", "0"])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--run-seconds", "inf"])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--sample-rate", "fast"])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--bind"])),
            Err(ConfigError::MissingValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--turbo"])),
            Err(ConfigError::UnknownOption(_))
        ));
    }

    #[test]
    fn bundled_profile_loads() {
        let path = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../profiles/single.json"));
        let sheet = EngineSource::File(path).load().unwrap();
        let params = rev_core::EngineParameters::new(sheet).unwrap();
        assert_eq!(params.cylinders(), 1);
        assert_eq!(params.harmonics().partials().len(), 6);
    }

    #[test]
    fn profile_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("v8.json");
        std::fs::write(&good, ParameterSheet::v8().to_json()).unwrap();
        assert_eq!(EngineSource::File(good).load().unwrap(), ParameterSheet::v8());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{\"cylinders\": 4}").unwrap();
        assert!(matches!(
            EngineSource::File(bad).load(),
            Err(ConfigError::Profile { .. })
        ));

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            EngineSource::File(missing).load(),
            Err(ConfigError::ProfileRead { .. })
        ));
    }
}
