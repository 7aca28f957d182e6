use rev_core::{tags, ControlInput, EngineState};
use serde::{Deserialize, Serialize};

pub const STATE_TAGS: &[tags::Tag] = &tags::STATE_COLUMNS;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn is_supported(&self) -> bool {
        self.major == 1
    }
}

/// Outbound engine state, one JSON object per line.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StateMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub unix_us: u64,
    pub tick: u64,
    pub rpm: f64,
    pub torque_nm: f64,
    pub angular_acceleration: f64,
    pub yield_w: f64,
    pub throttle: f64,
    pub load_torque_nm: f64,
}

impl StateMsg {
    pub fn new(sequence: u64, unix_us: u64, state: &EngineState, control: &ControlInput) -> Self {
        Self {
            msg_type: "state".to_string(),
            protocol_version: ProtocolVersion::v1(),
            sequence,
            unix_us,
            tick: state.tick,
            rpm: state.rpm,
            torque_nm: state.torque_nm,
            angular_acceleration: state.angular_acceleration,
            yield_w: state.yield_w,
            throttle: control.throttle,
            load_torque_nm: control.load_torque_nm,
        }
    }

    pub fn engine_state(&self) -> EngineState {
        EngineState {
            tick: self.tick,
            rpm: self.rpm,
            torque_nm: self.torque_nm,
            angular_acceleration: self.angular_acceleration,
            yield_w: self.yield_w,
        }
    }
}

/// Operator input. Omitted fields keep their current value.
#[derive(Debug, Deserialize)]
pub struct ControlMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sequence: u64,
    pub throttle: Option<f64>,
    pub load_torque_nm: Option<f64>,
}

impl ControlMsg {
    /// Fold this message over the control currently in effect.
    pub fn apply_to(&self, current: ControlInput) -> ControlInput {
        ControlInput {
            throttle: self.throttle.unwrap_or(current.throttle),
            load_torque_nm: self.load_torque_nm.unwrap_or(current.load_torque_nm),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.throttle.map_or(true, f64::is_finite) && self.load_torque_nm.map_or(true, f64::is_finite)
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    Control(ControlMsg),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "control" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Control),
            "hello" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Hello),
            _ => None,
        }
    }
}
