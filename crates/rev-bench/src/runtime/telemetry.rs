use crate::audio::AudioCounters;
use crate::infra::journal::{EventJournal, JournalEventType};
use rev_core::{SharedHistory, StateExchange, TimeBase};
use rev_io::metrics::{
    init_metrics, record_control, record_state, serve_metrics, AUDIO_BLOCKS, AUDIO_UNDERRUNS,
    JOURNAL_WRITE_FAILURES, TICKS_EXECUTED,
};
use std::sync::{atomic::AtomicBool, Arc, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

pub struct TelemetrySources {
    pub exchange: Arc<StateExchange>,
    pub history: SharedHistory,
    pub audio: AudioCounters,
    pub journal: Option<Arc<EventJournal>>,
    pub timebase: TimeBase,
}

/// Sample the exchange into the metrics registry, drain the history feed
/// and report audio underruns, until `stop` is raised.
pub fn start_metrics_updater(
    sources: TelemetrySources,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("rev-telemetry".to_string())
        .spawn(move || {
            let mut last_sequence = sources.exchange.published_sequence();
            let mut last_underruns = sources.audio.underruns();
            let mut last_blocks = sources.audio.blocks();

            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                sample(&sources, &mut last_sequence, &mut last_underruns, &mut last_blocks);
                thread::sleep(SAMPLE_INTERVAL);
            }
            sample(&sources, &mut last_sequence, &mut last_underruns, &mut last_blocks);
        })
}

fn sample(
    sources: &TelemetrySources,
    last_sequence: &mut u64,
    last_underruns: &mut u64,
    last_blocks: &mut u64,
) {
    if let Some(state) = sources.exchange.read_state() {
        record_state(&state);
    }
    record_control(&sources.exchange.read_control());

    let sequence = sources.exchange.published_sequence();
    if sequence > *last_sequence {
        TICKS_EXECUTED.inc_by(sequence - *last_sequence);
        *last_sequence = sequence;
    }

    // Keeps the feed from filling up between exports.
    sources
        .history
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain();

    let blocks = sources.audio.blocks();
    if blocks > *last_blocks {
        AUDIO_BLOCKS.inc_by(blocks - *last_blocks);
        *last_blocks = blocks;
    }

    let underruns = sources.audio.underruns();
    if underruns > *last_underruns {
        let delta = underruns - *last_underruns;
        AUDIO_UNDERRUNS.inc_by(delta);
        *last_underruns = underruns;
        warn!(new = delta, total = underruns, "Audio underruns at output");
        if let Some(journal) = &sources.journal {
            if let Err(e) = journal.log_event(
                sources.timebase.now_us(),
                sources.timebase.unix_us(),
                JournalEventType::AudioUnderruns,
                serde_json::json!({ "new": delta, "total": underruns }),
            ) {
                JOURNAL_WRITE_FAILURES.inc();
                warn!(error = %e, "Failed to write journal entry");
            }
        }
    }
}
