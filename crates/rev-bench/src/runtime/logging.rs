use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,rev_bench=debug,rev_io=debug,rev_core=debug";

/// Initialize the tracing subscriber with optional JSON output and an
/// optional daily-rolling JSON log file. `log` records from `rev-core` are
/// forwarded through the same subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the life of the process.
pub fn init_tracing(json_output: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_writer, guard): (Option<NonBlocking>, Option<WorkerGuard>) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rev-bench.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .with(
                file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .with(
                file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)),
            )
            .init();
    }

    guard
}
