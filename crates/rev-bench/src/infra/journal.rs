//! Session event journal.
//!
//! Appends one JSON object per line for the events worth keeping after a
//! run: session start and stop, stall recoveries, instability excursions,
//! audio underruns and exported files. Clock events arrive from the clock
//! thread, so every write goes through a mutex and never blocks on more
//! than a buffered file write.

use rev_core::{ClockEvent, ClockStats};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    SessionStart,
    SessionStop,
    StallRecovered,
    NumericalInstability,
    AudioUnderruns,
    ExportWritten,
    WavRendered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: JournalEventType,
    pub details: serde_json::Value,
}

pub struct EventJournal {
    writer: Mutex<BufWriter<File>>,
}

impl EventJournal {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: JournalEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&JournalEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }
}

/// Journal type and details for a clock event.
pub fn clock_event_details(event: &ClockEvent) -> (JournalEventType, serde_json::Value) {
    match event {
        ClockEvent::StallRecovered(stall) => (
            JournalEventType::StallRecovered,
            json!({
                "tick": stall.tick,
                "skipped_us": stall.skipped.as_micros() as u64,
                "steps_dropped": stall.steps_dropped,
            }),
        ),
        ClockEvent::NumericalInstability(warning) => (
            JournalEventType::NumericalInstability,
            json!({
                "tick": warning.tick,
                "requested_acceleration": warning.requested_acceleration,
                "limit": warning.limit,
            }),
        ),
    }
}

pub fn stop_details(stats: &ClockStats) -> serde_json::Value {
    json!({
        "ticks_executed": stats.ticks_executed,
        "iterations": stats.iterations,
        "stalls_recovered": stats.stalls_recovered,
        "instability_excursions": stats.instability_excursions,
        "max_steps_in_iteration": stats.max_steps_in_iteration,
        "max_jitter_us": stats.max_jitter_us,
        "history_dropped": stats.history_dropped,
    })
}
