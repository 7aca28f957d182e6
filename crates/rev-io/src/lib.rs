pub mod bridge;
pub mod export;
pub mod metrics;
pub mod protocol;

pub use bridge::{run_bridge, BridgeConfig, ControlRejection};
pub use export::{export_to_path, import_from_path, ExportError, ExportFormat};
pub use metrics::{init_metrics, serve_metrics};
pub use protocol::{ControlMsg, HelloMsg, IncomingMessage, ProtocolVersion, StateMsg};
