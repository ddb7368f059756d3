use serde::{Deserialize, Serialize};

pub const TOPIC_JOB_STATUS: &str = "job/status";
pub const TOPIC_JOBSHOP: &str = "jobshop/status";
pub const TOPIC_JOB_TELEMETRY: &str = "job/telemetry";
pub const TOPIC_JOB_ALERTS: &str = "job/alerts";

pub const REASON_THRESHOLD_EXCEEDED: &str = "threshold_exceeded";
pub const REASON_WILL_FAIL: &str = "will_fail";
pub const METHOD_IHA: &str = "IHA";

/// Job-shop lifecycle event as published on `jobshop/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobShopEvent {
    #[serde(rename = "STARTED")]
    Started {
        timestamp: u64,
        job_id: String,
        machine_id: String,
        required_class: String,
        step_remaining: u32,
        method: String,
    },
    #[serde(rename = "STEP_DONE")]
    StepDone {
        timestamp: u64,
        job_id: String,
        next_required_class: String,
    },
    #[serde(rename = "COMPLETED")]
    Completed {
        timestamp: u64,
        job_id: String,
        machine_id: String,
    },
    #[serde(rename = "FAILED")]
    Failed {
        timestamp: u64,
        machine_id: String,
        class: String,
        job_id: String,
        reason: String,
        temperature: f64,
        vibration: f64,
    },
    #[serde(rename = "PREDICTION")]
    Prediction {
        timestamp: u64,
        machine_id: String,
        job_id: String,
        reason: String,
        risk_score: f64,
        threshold: f64,
    },
}

/// Per-machine snapshot, retained on `job/status` so late subscribers
/// immediately see the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub timestamp: u64,
    pub machine_id: String,
    pub class_name: String,
    pub temperature: f64,
    pub vibration: f64,
    pub status: String,
    pub current_job: String,
    pub temp_threshold: f64,
    pub vib_threshold: f64,
    pub power_kwh_total: f64,
}

/// Raw signal sample on `job/telemetry` (not retained).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub timestamp: u64,
    pub class_name: String,
    pub machine_id: String,
    pub temperature_c: f64,
    pub vibration_rms_mm_s: f64,
    pub seq: u64,
}

/// Inbound risk alert from the external inference service on `job/alerts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: String,
    pub machine_id: String,
    pub risk_score: f64,
    pub threshold: f64,
    pub red_flag: bool,
}
