//! Prometheus metrics for the engine bench.
//!
//! Everything here is updated from the clock thread, the bridge and the
//! telemetry sampler. The audio callback never touches the registry; it
//! counts underruns in an atomic that the sampler forwards.

use rev_core::{tags, ControlInput, EngineState};
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Simulation Clock Metrics
// ============================================================================

/// Total simulation ticks executed
pub static TICKS_EXECUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_ticks_executed_total",
        "Total fixed simulation steps executed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Stalls where accumulated time was discarded
pub static STALLS_RECOVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_stalls_recovered_total",
        "Clock iterations whose backlog exceeded the step bound and was discarded",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Excursions where acceleration had to be clamped
pub static INSTABILITY_EXCURSIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_instability_excursions_total",
        "Excursions during which angular acceleration was clamped",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// States the history window could not keep up with
pub static HISTORY_DROPPED: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "revbench_history_dropped",
        "States dropped because the history feed was full",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Audio Metrics
// ============================================================================

/// Device callbacks that arrived more than twice their block length late
pub static AUDIO_UNDERRUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_audio_underruns_total",
        "Late audio callbacks at the output boundary; each late block is rendered from the latest state",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Audio blocks rendered
pub static AUDIO_BLOCKS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_audio_blocks_total",
        "Audio blocks rendered by the synthesizer",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Event journal entries that could not be written
pub static JOURNAL_WRITE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_journal_write_failures_total",
        "Event journal entries lost to I/O errors",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Engine State Metrics
// ============================================================================

pub static ENGINE_RPM: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(tags::RPM.metric, "Current engine speed in RPM").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static ENGINE_TORQUE_NM: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(tags::TORQUE_NM.metric, "Torque produced at the crank").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static ENGINE_ANGULAR_ACCELERATION: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        tags::ANGULAR_ACCELERATION.metric,
        "Angular acceleration of the crank in rad/s^2",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static ENGINE_YIELD_W: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(tags::YIELD_W.metric, "Instantaneous power in watts").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static ENGINE_TICK: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(tags::TICK.metric, "Tick index of the latest published state").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Control Metrics
// ============================================================================

pub static CONTROL_THROTTLE: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(tags::THROTTLE.metric, "Requested throttle (0.0-1.0)").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static CONTROL_LOAD_NM: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(tags::LOAD_TORQUE_NM.metric, "Requested external load torque").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Control messages rejected for sequence regressions
pub static CONTROL_OUT_OF_ORDER: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_control_out_of_order_total",
        "Control messages rejected due to out-of-order sequence",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Control messages rejected for any other reason
pub static CONTROL_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "revbench_control_rejected_total",
        "Control messages rejected (bad version, missing handshake, non-finite values)",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Bridge client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "revbench_bridge_connected",
        "Bridge client connection status (1=connected, 0=disconnected)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub fn record_state(state: &EngineState) {
    ENGINE_TICK.set(state.tick as i64);
    ENGINE_RPM.set(state.rpm);
    ENGINE_TORQUE_NM.set(state.torque_nm);
    ENGINE_ANGULAR_ACCELERATION.set(state.angular_acceleration);
    ENGINE_YIELD_W.set(state.yield_w);
}

pub fn record_control(control: &ControlInput) {
    CONTROL_THROTTLE.set(control.throttle);
    CONTROL_LOAD_NM.set(control.load_torque_nm);
}

/// Encode the registry in the Prometheus text format.
pub fn gather_text() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let buffer = match gather_text() {
                        Ok(buffer) => buffer,
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            let _ = request.respond(
                                Response::from_string("Internal Server Error")
                                    .with_status_code(500),
                            );
                            continue;
                        }
                    };

                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once the clock has published at least one state
                    if TICKS_EXECUTED.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = TICKS_EXECUTED.get();
    let _ = STALLS_RECOVERED.get();
    let _ = INSTABILITY_EXCURSIONS.get();
    let _ = HISTORY_DROPPED.get();
    let _ = AUDIO_UNDERRUNS.get();
    let _ = AUDIO_BLOCKS.get();
    let _ = JOURNAL_WRITE_FAILURES.get();
    let _ = ENGINE_TICK.get();
    let _ = ENGINE_RPM.get();
    let _ = ENGINE_TORQUE_NM.get();
    let _ = ENGINE_ANGULAR_ACCELERATION.get();
    let _ = ENGINE_YIELD_W.get();
    let _ = CONTROL_THROTTLE.get();
    let _ = CONTROL_LOAD_NM.get();
    let _ = CONTROL_OUT_OF_ORDER.get();
    let _ = CONTROL_REJECTED.get();
    let _ = BRIDGE_CONNECTED.get();
}
