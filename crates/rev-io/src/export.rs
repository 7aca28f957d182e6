//! History export as CSV or JSON Lines, with parsers for reading it back.
//!
//! Floats are written with Rust's shortest round-trip formatting, so parsing
//! an export gives back exactly the states that were written.

use rev_core::{tags, EngineState};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected CSV header {found:?}")]
    Header { found: String },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    JsonLines,
}

impl ExportFormat {
    /// Guess from a file extension; anything that isn't `.csv` is JSON Lines.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::JsonLines,
        }
    }
}

pub fn write_csv<W: Write>(mut out: W, states: &[EngineState]) -> Result<(), ExportError> {
    writeln!(out, "{}", tags::csv_header())?;
    for s in states {
        writeln!(
            out,
            "{},{},{},{},{}",
            s.tick, s.rpm, s.torque_nm, s.angular_acceleration, s.yield_w
        )?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_csv<R: BufRead>(input: R) -> Result<Vec<EngineState>, ExportError> {
    let mut lines = input.lines();
    let header = lines.next().transpose()?.unwrap_or_default();
    if header.trim() != tags::csv_header() {
        return Err(ExportError::Header {
            found: header.trim().to_string(),
        });
    }

    let mut states = Vec::new();
    for (index, line) in lines.enumerate() {
        let line = line?;
        let line_no = index + 2;
        if line.trim().is_empty() {
            continue;
        }
        states.push(parse_csv_row(line.trim(), line_no)?);
    }
    Ok(states)
}

fn parse_csv_row(row: &str, line: usize) -> Result<EngineState, ExportError> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() != tags::STATE_COLUMNS.len() {
        return Err(ExportError::Parse {
            line,
            message: format!(
                "expected {} fields, found {}",
                tags::STATE_COLUMNS.len(),
                fields.len()
            ),
        });
    }

    let float = |i: usize| -> Result<f64, ExportError> {
        fields[i].parse::<f64>().map_err(|e| ExportError::Parse {
            line,
            message: format!("{}: {}", tags::STATE_COLUMNS[i].key, e),
        })
    };
    let tick = fields[0].parse::<u64>().map_err(|e| ExportError::Parse {
        line,
        message: format!("{}: {}", tags::TICK.key, e),
    })?;

    Ok(EngineState {
        tick,
        rpm: float(1)?,
        torque_nm: float(2)?,
        angular_acceleration: float(3)?,
        yield_w: float(4)?,
    })
}

pub fn write_jsonl<W: Write>(mut out: W, states: &[EngineState]) -> Result<(), ExportError> {
    for (index, s) in states.iter().enumerate() {
        serde_json::to_writer(&mut out, s).map_err(|source| ExportError::Json {
            line: index + 1,
            source,
        })?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_jsonl<R: BufRead>(input: R) -> Result<Vec<EngineState>, ExportError> {
    let mut states = Vec::new();
    for (index, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let state = serde_json::from_str(&line).map_err(|source| ExportError::Json {
            line: index + 1,
            source,
        })?;
        states.push(state);
    }
    Ok(states)
}

/// Write `states` to `path` in the given format.
pub fn export_to_path(
    path: &Path,
    format: ExportFormat,
    states: &[EngineState],
) -> Result<(), ExportError> {
    let out = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Csv => write_csv(out, states),
        ExportFormat::JsonLines => write_jsonl(out, states),
    }
}

pub fn import_from_path(path: &Path, format: ExportFormat) -> Result<Vec<EngineState>, ExportError> {
    let input = BufReader::new(File::open(path)?);
    match format {
        ExportFormat::Csv => read_csv(input),
        ExportFormat::JsonLines => read_jsonl(input),
    }
}
