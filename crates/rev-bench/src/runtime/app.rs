use crate::audio::{render_wav, AudioCounters, AudioError, WavPlan};
use crate::infra::journal::{clock_event_details, stop_details, EventJournal, JournalEventType};
use crate::runtime::config::{ConfigError, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry::{self, TelemetrySources};
use rev_core::{
    ClockEvent, ClockStats, ConfigurationError, CurveTorqueModel, Session, SessionError,
    SharedHistory, TimeBase,
};
use rev_io::bridge::{run_bridge, BridgeConfig};
use rev_io::export::{export_to_path, ExportError, ExportFormat};
use rev_io::metrics::{
    HISTORY_DROPPED, INSTABILITY_EXCURSIONS, JOURNAL_WRITE_FAILURES, STALLS_RECOVERED,
    TICKS_EXECUTED,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::{atomic::AtomicBool, Arc, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid engine parameters: {0}")]
    Parameters(#[from] ConfigurationError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("failed to open journal: {0}")]
    Journal(#[source] std::io::Error),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Counts and journals clock events. Runs on the clock thread, so it only
/// touches atomics and the journal's buffered writer; failed writes are
/// counted, not logged.
#[derive(Clone)]
struct EventSink {
    journal: Option<Arc<EventJournal>>,
    timebase: TimeBase,
}

impl EventSink {
    fn handle(&self, event: &ClockEvent) {
        match event {
            ClockEvent::StallRecovered(_) => STALLS_RECOVERED.inc(),
            ClockEvent::NumericalInstability(_) => INSTABILITY_EXCURSIONS.inc(),
        }
        let (event_type, details) = clock_event_details(event);
        let _ = self.write(event_type, details);
    }

    fn record(&self, event_type: JournalEventType, details: serde_json::Value) {
        if let Err(e) = self.write(event_type, details) {
            warn!(error = %e, "Failed to write journal entry");
        }
    }

    fn write(&self, event_type: JournalEventType, details: serde_json::Value) -> std::io::Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        journal
            .log_event(self.timebase.now_us(), self.timebase.unix_us(), event_type, details)
            .inspect_err(|_| JOURNAL_WRITE_FAILURES.inc())
    }
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}\n\nRun with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }

    // Flushes the file logger on drop, after everything below has logged.
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "rev-bench failed");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    if config.list_devices {
        for name in crate::audio::list_output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    // Initialize metrics
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let sheet = config.engine.load()?;
    let session = Session::new(sheet, CurveTorqueModel, config.session_config())?;
    session.control().set(config.throttle, config.load_torque_nm);

    let journal = match &config.journal_path {
        Some(path) => {
            let journal = EventJournal::new(path).map_err(AppError::Journal)?;
            info!(path = %path.display(), "Event journal enabled");
            Some(Arc::new(journal))
        }
        None => None,
    };
    let sink = EventSink { journal, timebase };

    let params = session.params();
    info!(
        engine = params.name(),
        cylinders = params.cylinders(),
        idle_rpm = params.idle_rpm(),
        redline_rpm = params.redline_rpm(),
        tick_us = config.tick_us,
        "Engine session configured"
    );
    sink.record(
        JournalEventType::SessionStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": params.name(),
            "cylinders": params.cylinders(),
            "tick_us": config.tick_us,
            "mode": if config.wav_path.is_some() { "offline" } else { "realtime" },
        }),
    );

    let history = session.history();
    let stats = match &config.wav_path {
        Some(path) => render_offline(session, &config, path, &sink)?,
        None => run_realtime(session, &config, &sink)?,
    };

    HISTORY_DROPPED.set(stats.history_dropped as i64);
    export_history(&history, &config, &sink)?;

    info!(
        ticks_executed = stats.ticks_executed,
        stalls_recovered = stats.stalls_recovered,
        instability_excursions = stats.instability_excursions,
        max_steps_in_iteration = stats.max_steps_in_iteration,
        max_jitter_us = stats.max_jitter_us,
        history_dropped = stats.history_dropped,
        "Run complete"
    );
    sink.record(JournalEventType::SessionStop, stop_details(&stats));
    Ok(())
}

fn run_realtime(
    session: Session<CurveTorqueModel>,
    config: &RuntimeConfig,
    sink: &EventSink,
) -> Result<ClockStats, AppError> {
    let stop = Arc::new(AtomicBool::new(false));

    let clock_sink = sink.clone();
    let running = session.start(move |event| clock_sink.handle(event))?;

    let bridge_handle = if config.bridge_enabled {
        let exchange_bridge = running.exchange();
        let stop_bridge = Arc::clone(&stop);
        let timebase_bridge = sink.timebase;
        let bridge_config = BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            require_handshake: config.bridge_require_handshake,
            ..Default::default()
        };
        info!(addr = %bridge_config.bind_addr, "Starting bridge");
        Some(
            thread::Builder::new()
                .name("rev-bridge".to_string())
                .spawn(move || {
                    if let Err(e) =
                        run_bridge(exchange_bridge, timebase_bridge, bridge_config, stop_bridge)
                    {
                        error!(error = %e, "Bridge failed to start");
                    }
                })
                .map_err(AppError::Spawn)?,
        )
    } else {
        info!("Bridge disabled");
        None
    };

    let audio_counters = AudioCounters::new();
    #[cfg(feature = "audio")]
    let audio_output = if config.audio_enabled {
        match crate::audio::start_output(
            config.audio_device.as_deref(),
            |sample_rate| running.synthesizer(config.synth_config(sample_rate)),
            audio_counters.clone(),
        ) {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(error = %e, "Audio output unavailable; continuing without sound");
                None
            }
        }
    } else {
        None
    };
    #[cfg(not(feature = "audio"))]
    if config.audio_enabled {
        warn!(device = ?config.audio_device, "Built without the 'audio' feature; --audio ignored");
    }

    let telemetry_handle = telemetry::start_metrics_updater(
        TelemetrySources {
            exchange: running.exchange(),
            history: running.history(),
            audio: audio_counters,
            journal: sink.journal.clone(),
            timebase: sink.timebase,
        },
        Arc::clone(&stop),
    )
    .map_err(AppError::Spawn)?;

    info!("rev-bench running. Connect a control client to drive throttle and load.");

    match config.run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            thread::sleep(Duration::from_secs_f64(seconds));
        }
        None => {
            while running.is_running() {
                thread::sleep(Duration::from_millis(500));
            }
        }
    }

    #[cfg(feature = "audio")]
    drop(audio_output);

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let result = running.stop();
    if let Some(handle) = bridge_handle {
        let _ = handle.join();
    }
    let _ = telemetry_handle.join();

    let (_session, stats) = result?;
    Ok(stats)
}

fn render_offline(
    session: Session<CurveTorqueModel>,
    config: &RuntimeConfig,
    path: &Path,
    sink: &EventSink,
) -> Result<ClockStats, AppError> {
    let plan = WavPlan {
        seconds: config.wav_seconds(),
        block_size: config.block_size,
        float_samples: config.wav_float,
    };
    info!(
        path = %path.display(),
        seconds = plan.seconds,
        sample_rate = config.sample_rate,
        block_size = plan.block_size,
        "Rendering offline"
    );

    let mut synth = session.synthesizer(config.synth_config(config.sample_rate));
    let history = session.history();

    let mut clock = session.into_clock();
    let mut on_event = |event: &ClockEvent| sink.handle(event);
    let summary = render_wav(path, &mut clock, &mut synth, Some(&history), plan, &mut on_event)?;

    let stats = clock.stats().clone();
    TICKS_EXECUTED.inc_by(stats.ticks_executed);
    info!(
        samples = summary.samples,
        blocks = summary.blocks,
        peak = summary.peak,
        "WAV written"
    );
    sink.record(
        JournalEventType::WavRendered,
        serde_json::json!({
            "path": path.display().to_string(),
            "samples": summary.samples,
            "sample_rate": config.sample_rate,
            "peak": summary.peak,
        }),
    );
    Ok(stats)
}

fn export_history(
    history: &SharedHistory,
    config: &RuntimeConfig,
    sink: &EventSink,
) -> Result<(), AppError> {
    let targets = [
        (config.export_csv.as_deref(), ExportFormat::Csv),
        (config.export_json.as_deref(), ExportFormat::JsonLines),
    ];
    if targets.iter().all(|(path, _)| path.is_none()) {
        return Ok(());
    }

    let states = history
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .snapshot();

    for (path, format) in targets {
        let Some(path) = path else { continue };
        export_to_path(path, format, &states)?;
        info!(path = %path.display(), format = ?format, states = states.len(), "History exported");
        sink.record(
            JournalEventType::ExportWritten,
            serde_json::json!({
                "path": path.display().to_string(),
                "format": format!("{format:?}"),
                "states": states.len(),
            }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rev_core::SimulationStallRecovered;

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_clock_journal_writes_are_counted() {
        let journal = EventJournal::new(Path::new("/dev/full")).unwrap();
        let sink = EventSink {
            journal: Some(Arc::new(journal)),
            timebase: TimeBase::new(),
        };
        let before = JOURNAL_WRITE_FAILURES.get();

        sink.handle(&ClockEvent::StallRecovered(SimulationStallRecovered {
            tick: 10,
            skipped: Duration::from_secs(2),
            steps_dropped: 2_000,
        }));

        assert!(JOURNAL_WRITE_FAILURES.get() > before);
        assert!(STALLS_RECOVERED.get() >= 1);
    }

    #[test]
    fn sink_without_journal_only_counts() {
        let sink = EventSink {
            journal: None,
            timebase: TimeBase::new(),
        };
        let before = INSTABILITY_EXCURSIONS.get();
        sink.handle(&ClockEvent::NumericalInstability(
            rev_core::NumericalInstabilityWarning {
                tick: 3,
                requested_acceleration: 1.0e6,
                limit: 5.0e4,
            },
        ));
        assert!(INSTABILITY_EXCURSIONS.get() > before);
    }
}
