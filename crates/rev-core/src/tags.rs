/// Names under which one engine-state field is exported.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    /// Column header in CSV exports and key in JSON messages.
    pub key: &'static str,
    pub metric: &'static str,
    pub unit: &'static str,
}

pub const TICK: Tag = Tag {
    key: "tick",
    metric: "revbench_tick",
    unit: "",
};

pub const RPM: Tag = Tag {
    key: "rpm",
    metric: "revbench_engine_rpm",
    unit: "rpm",
};

pub const TORQUE_NM: Tag = Tag {
    key: "torque_nm",
    metric: "revbench_engine_torque_newton_metres",
    unit: "N·m",
};

pub const ANGULAR_ACCELERATION: Tag = Tag {
    key: "angular_acceleration",
    metric: "revbench_engine_angular_acceleration",
    unit: "rad/s²",
};

pub const YIELD_W: Tag = Tag {
    key: "yield_w",
    metric: "revbench_engine_yield_watts",
    unit: "W",
};

/// Field order of an exported [`EngineState`](crate::EngineState).
pub const STATE_COLUMNS: [Tag; 5] = [TICK, RPM, TORQUE_NM, ANGULAR_ACCELERATION, YIELD_W];

pub const THROTTLE: Tag = Tag {
    key: "throttle",
    metric: "revbench_control_throttle",
    unit: "",
};

pub const LOAD_TORQUE_NM: Tag = Tag {
    key: "load_torque_nm",
    metric: "revbench_control_load_torque_newton_metres",
    unit: "N·m",
};

/// Comma-separated header for CSV exports.
pub fn csv_header() -> String {
    STATE_COLUMNS
        .iter()
        .map(|t| t.key)
        .collect::<Vec<_>>()
        .join(",")
}
