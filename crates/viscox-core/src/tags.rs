/// Naming for one recorded series across every surface it appears on.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub header: &'static str,
    pub metric: &'static str,
    pub rerun_path: &'static str,
}

pub const SENSOR_LOAD: Tag = Tag {
    header: "Sensor Data",
    metric: "viscox_sensor_last_value",
    rerun_path: "sensor/load",
};

pub const MOTOR_RPM: Tag = Tag {
    header: "Motor Data",
    metric: "viscox_motor_commanded_rpm",
    rerun_path: "motor/commanded_rpm",
};

pub const RUN_STATE: Tag = Tag {
    header: "Run State",
    metric: "viscox_ramp_run_state",
    rerun_path: "motor/run_state",
};

/// Header cell preceding the timestamp column of every record section.
pub const TIME_HEADER: &str = "Time";

/// Label used for the export written automatically at the end of every ramp.
pub const AUTOSAVE_LABEL: &str = "autosave";
