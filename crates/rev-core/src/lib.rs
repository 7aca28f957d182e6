pub mod clock;
mod dynamics_proptest;
pub mod error;
pub mod harmonics;
pub mod history;
pub mod integrator;
pub mod monitor;
pub mod params;
pub mod session;
pub mod state;
pub mod synth;
pub mod sync;
pub mod tags;
pub mod timebase;
pub mod torque;

pub use clock::{ClockConfig, ClockEvent, ClockStats, PumpReport, SimulationClock, SimulationStallRecovered};
pub use error::{ConfigurationError, SessionError};
pub use harmonics::{HarmonicTable, Partial};
pub use history::{history_channel, HistoryFeed, SharedHistory, StateHistory};
pub use integrator::{DynamicsIntegrator, StepOutcome};
pub use monitor::{InstabilityMonitor, NumericalInstabilityWarning};
pub use params::{EngineParameters, ParameterSheet};
pub use session::{ControlHandle, RunningSession, Session, SessionConfig};
pub use state::{ControlInput, EngineState, SimulationLimits};
pub use synth::{AudioFrame, AudioSynthesizer, BlockInterpolation, SynthConfig};
pub use sync::{StatePair, StateExchange};
pub use timebase::TimeBase;
pub use torque::{CurvePoint, CurveTorqueModel, Torque, TorqueCurve, TorqueModel};
