use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use thiserror::Error;

use crate::bus::AlertInbox;
use crate::bus::events::Alert;
use crate::sim::machines::Machine;

#[derive(Debug, Error)]
#[error("risk model failure: {0}")]
pub struct RiskError(pub String);

/// Feature record handed to the failure-risk model, one per busy machine
/// per tick. Field names match the model's training schema; deltas are
/// absent on a machine's first observation.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRow {
    pub temperature_c: f64,
    pub vibration_rms_mm_s: f64,
    pub temp_threshold: f64,
    pub vib_threshold: f64,
    pub dt_seconds: Option<f64>,
    pub d_temp: Option<f64>,
    pub d_vibration: Option<f64>,
    pub pct_of_temp_thresh: f64,
    pub pct_of_vib_thresh: f64,
    pub temp_avg_win: f64,
    pub temp_std_win: f64,
    pub vib_avg_win: f64,
    pub vib_std_win: f64,
    pub machine_id: String,
    pub class_name: String,
}

/// Narrow contract to the external failure model. The kernel floors the
/// model's operating threshold at the configured minimum.
pub trait RiskModel {
    fn predict_risk(&mut self, features: &FeatureRow) -> Result<f64, RiskError>;

    fn threshold(&self) -> f64 {
        0.5
    }
}

#[derive(Debug, Clone, Copy)]
struct PrevSample {
    tick_ms: i64,
    temperature: f64,
    vibration: f64,
}

#[derive(Debug, Default)]
struct Rolling {
    temp: VecDeque<f64>,
    vib: VecDeque<f64>,
}

/// Builds feature rows from machine state, owning all per-machine rolling
/// state (previous sample + signal windows).
#[derive(Debug)]
pub struct FeatureAdapter {
    window: usize,
    prev: HashMap<String, PrevSample>,
    rolling: HashMap<String, Rolling>,
}

impl FeatureAdapter {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            prev: HashMap::new(),
            rolling: HashMap::new(),
        }
    }

    pub fn observe(&mut self, machine: &Machine, tick: u64) -> FeatureRow {
        let temp = machine.temperature;
        let vib = machine.vibration;
        let tick_ms = (tick as i64) * 1000;

        let (dt_seconds, d_temp, d_vibration) = match self.prev.get(&machine.machine_id) {
            Some(prev) => (
                Some((tick_ms - prev.tick_ms) as f64 / 1000.0),
                Some(temp - prev.temperature),
                Some(vib - prev.vibration),
            ),
            None => (None, None, None),
        };
        self.prev.insert(
            machine.machine_id.clone(),
            PrevSample {
                tick_ms,
                temperature: temp,
                vibration: vib,
            },
        );

        let rolling = self.rolling.entry(machine.machine_id.clone()).or_default();
        push_capped(&mut rolling.temp, temp, self.window);
        push_capped(&mut rolling.vib, vib, self.window);

        FeatureRow {
            temperature_c: temp,
            vibration_rms_mm_s: vib,
            temp_threshold: machine.temp_threshold,
            vib_threshold: machine.vib_threshold,
            dt_seconds,
            d_temp,
            d_vibration,
            pct_of_temp_thresh: ratio(temp, machine.temp_threshold),
            pct_of_vib_thresh: ratio(vib, machine.vib_threshold),
            temp_avg_win: mean(&rolling.temp),
            temp_std_win: sample_std(&rolling.temp),
            vib_avg_win: mean(&rolling.vib),
            vib_std_win: sample_std(&rolling.vib),
            machine_id: machine.machine_id.clone(),
            class_name: machine.class_name.clone(),
        }
    }
}

fn push_capped(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold > 0.0 { value / threshold } else { 0.0 }
}

fn mean(buf: &VecDeque<f64>) -> f64 {
    if buf.is_empty() {
        return 0.0;
    }
    buf.iter().sum::<f64>() / buf.len() as f64
}

fn sample_std(buf: &VecDeque<f64>) -> f64 {
    let n = buf.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(buf);
    let var = buf.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Threshold-proximity model used when no trained model is wired in: a
/// logistic over the worst signal-to-threshold ratio, nudged by a rising
/// trend. Deterministic, so seeded runs stay reproducible.
#[derive(Debug)]
pub struct HeuristicRiskModel {
    threshold: f64,
}

impl HeuristicRiskModel {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl RiskModel for HeuristicRiskModel {
    fn predict_risk(&mut self, features: &FeatureRow) -> Result<f64, RiskError> {
        let pressure = features
            .pct_of_temp_thresh
            .max(features.pct_of_vib_thresh);
        let trend = features.d_temp.unwrap_or(0.0) / features.temp_threshold.max(1.0)
            + features.d_vibration.unwrap_or(0.0) / features.vib_threshold.max(1.0);
        let drive = pressure + trend.max(0.0) - 0.85;
        let score = 1.0 / (1.0 + (-12.0 * drive).exp());
        Ok(score.clamp(0.0, 1.0))
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Adapter over the `job/alerts` feed: a machine's score is the external
/// inference service's most recent alert for it, and the operating
/// threshold tracks the latest alert's. Machines the service has not
/// scored yet read as zero risk.
pub struct AlertFeedModel {
    inbox: AlertInbox,
    latest: HashMap<String, Alert>,
    threshold: f64,
}

impl AlertFeedModel {
    pub fn new(inbox: AlertInbox, threshold: f64) -> Self {
        Self {
            inbox,
            latest: HashMap::new(),
            threshold,
        }
    }
}

impl RiskModel for AlertFeedModel {
    fn predict_risk(&mut self, features: &FeatureRow) -> Result<f64, RiskError> {
        for alert in self.inbox.drain() {
            self.threshold = alert.threshold;
            self.latest.insert(alert.machine_id.clone(), alert);
        }
        Ok(self
            .latest
            .get(&features.machine_id)
            .map_or(0.0, |alert| alert.risk_score))
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Test stub returning a constant score.
#[cfg(test)]
#[derive(Debug)]
pub struct FixedRiskModel {
    pub score: f64,
    pub threshold: f64,
}

#[cfg(test)]
impl RiskModel for FixedRiskModel {
    fn predict_risk(&mut self, _features: &FeatureRow) -> Result<f64, RiskError> {
        Ok(self.score)
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }
}
