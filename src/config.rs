use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sim::planner::DEFAULT_WEIGHTS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    pub class_name: String,
    pub machine_id: String,
    pub temp_base: f64,
    pub temp_threshold: f64,
    pub vib_base: f64,
    pub vib_threshold: f64,
    pub repair_time: u32,
}

impl MachineSpec {
    fn new(
        class_name: &str,
        machine_id: &str,
        temp_base: f64,
        temp_threshold: f64,
        vib_base: f64,
        vib_threshold: f64,
        repair_time: u32,
    ) -> Self {
        Self {
            class_name: class_name.to_string(),
            machine_id: machine_id.to_string(),
            temp_base,
            temp_threshold,
            vib_base,
            vib_threshold,
            repair_time,
        }
    }
}

/// All recognized simulation options. Every field has a default, so a
/// config file only needs the overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Wall-clock delay between ticks in real-time mode.
    pub tick_seconds: f64,
    /// Simulated minutes per tick; energy accrues as kW * tick_minutes/60.
    pub tick_minutes: f64,
    pub seed: u64,
    /// Jobs generated at init.
    pub seed_jobs: u32,
    /// If > 0, enqueue one new random job every N ticks.
    pub inflow_interval: u64,
    /// Hard tick cap for the driver; 0 runs until quiescence.
    pub max_ticks: u64,
    /// Ticks between global re-plans.
    pub iha_interval: u64,
    /// Flow-time / workload weights for the re-planner.
    pub iha_weights: (f64, f64),
    /// Rolling window length for predictor features.
    pub window: usize,
    /// Label-flush delay, forwarded to the edge collaborator.
    pub flush_delay: u64,
    /// Model operating threshold (the trained model may override it).
    pub risk_threshold: f64,
    /// Minimum effective threshold, against cold-start thrashing.
    pub risk_threshold_floor: f64,
    /// Pct-of-threshold gate below which preemption never fires.
    pub near_limit_ratio: f64,
    /// Independent per-signal spike probability per busy tick.
    pub failure_spike_prob: f64,
    /// Snap signals to base when repair completes.
    pub repair_idle_reset: bool,
    /// Confirmed-idle ticks before graceful shutdown.
    pub quiescence_grace: u32,
    /// Outbound bus channel capacity.
    pub event_capacity: usize,
    pub machines: Vec<MachineSpec>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1.0,
            tick_minutes: 1.0,
            seed: 42,
            seed_jobs: 5,
            inflow_interval: 0,
            max_ticks: 0,
            iha_interval: 10,
            iha_weights: DEFAULT_WEIGHTS,
            window: 5,
            flush_delay: 1,
            risk_threshold: 0.5,
            risk_threshold_floor: 0.32,
            near_limit_ratio: 0.80,
            failure_spike_prob: 0.07,
            repair_idle_reset: true,
            quiescence_grace: 1,
            event_capacity: 256,
            machines: default_fleet(),
        }
    }
}

pub fn default_fleet() -> Vec<MachineSpec> {
    vec![
        MachineSpec::new("A", "A_1", 40.0, 100.0, 2.0, 16.0, 3),
        MachineSpec::new("A", "A_2", 41.0, 86.0, 2.2, 8.5, 3),
        MachineSpec::new("A", "A_3", 42.0, 87.0, 2.1, 8.5, 3),
        MachineSpec::new("B", "B_1", 50.0, 110.0, 4.0, 18.0, 5),
        MachineSpec::new("B", "B_2", 49.0, 100.0, 3.8, 14.0, 5),
        MachineSpec::new("C", "C_1", 30.0, 110.0, 3.0, 14.0, 4),
        MachineSpec::new("C", "C_2", 31.0, 81.0, 3.2, 10.0, 4),
        MachineSpec::new("D", "D_1", 35.0, 120.0, 1.5, 19.0, 6),
    ]
}

/// Load a RON config file; a missing `path` argument means defaults, a
/// missing file is an error the operator should see.
pub fn load(path: Option<&Path>) -> Result<SimConfig> {
    let Some(path) = path else {
        return Ok(SimConfig::default());
    };
    match fs::read_to_string(path) {
        Ok(content) => {
            let config = ron::from_str(&content)
                .with_context(|| format!("invalid config {}", path.display()))?;
            Ok(config)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            anyhow::bail!("config file not found: {}", path.display())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}
