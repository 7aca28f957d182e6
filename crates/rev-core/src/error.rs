use thiserror::Error;

/// Malformed engine parameters. Raised while a session is being configured,
/// never from inside a running tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("torque curve needs at least two break points, got {count}")]
    TooFewBreakPoints { count: usize },

    #[error("torque curve break points must be strictly increasing (index {index}: {rpm} rpm after {previous_rpm} rpm)")]
    NonIncreasingBreakPoints {
        index: usize,
        rpm: f64,
        previous_rpm: f64,
    },

    #[error("torque curve point {index} is not a finite, non-negative value (rpm={rpm}, torque={torque_nm})")]
    InvalidBreakPoint {
        index: usize,
        rpm: f64,
        torque_nm: f64,
    },

    #[error("{field} must be finite and strictly positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("idle rpm {idle_rpm} must lie strictly between 0 and redline {redline_rpm}")]
    IdleOutsideRange { idle_rpm: f64, redline_rpm: f64 },

    #[error("cylinder count {count} outside supported range 1..=16")]
    CylinderCount { count: u32 },

    #[error("idle throttle {value} must lie in [0, 1)")]
    IdleThrottle { value: f64 },

    #[error("harmonic table: {0}")]
    HarmonicTable(String),

    #[error("failed to parse engine parameters: {0}")]
    Parse(String),
}

/// Failures while starting or stopping a session's clock thread.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn simulation thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("simulation thread panicked")]
    ClockPanicked,
}
