use rand::Rng;
use thiserror::Error;

use crate::bus::events::MachineStatus;
use crate::sim::jobs::Job;

const IDLE_TEMP_COOLDOWN: f64 = 1.2;
const IDLE_VIB_COOLDOWN: f64 = 0.25;
const BUSY_TEMP_NOISE: (f64, f64) = (-1.0, 1.4);
const BUSY_VIB_NOISE: (f64, f64) = (-0.4, 0.6);
const TEMP_SPIKE: (f64, f64) = (2.0, 6.0);
const VIB_SPIKE: (f64, f64) = (0.8, 2.0);

/// Environment knobs shared by every machine step.
#[derive(Debug, Clone)]
pub struct Physics {
    pub failure_spike_prob: f64,
    pub tick_minutes: f64,
    pub repair_idle_reset: bool,
}

impl Default for Physics {
    fn default() -> Self {
        Self {
            failure_spike_prob: 0.07,
            tick_minutes: 1.0,
            repair_idle_reset: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignError {
    #[error("machine is busy")]
    NotIdle,
    #[error("machine is repairing")]
    Repairing,
    #[error("job requires class {required}, machine is class {actual}")]
    ClassMismatch { required: String, actual: String },
}

/// A refused assignment hands the job back so the caller can requeue it.
#[derive(Debug)]
pub struct AssignRejected {
    pub job: Job,
    pub reason: AssignError,
}

/// What a machine reports after advancing one tick with a job aboard.
/// The job is detached and travels with the event.
#[derive(Debug)]
pub enum MachineEvent {
    Failed(Job),
    StepDone(Job),
    Completed(Job),
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub class_name: String,
    pub machine_id: String,
    pub temp_base: f64,
    pub temp_threshold: f64,
    pub vib_base: f64,
    pub vib_threshold: f64,
    pub repair_time: u32,

    pub temperature: f64,
    pub vibration: f64,
    pub busy_with: Option<Job>,
    pub repairing_left: u32,
    pub total_power_kwh: f64,
}

impl Machine {
    pub fn new(
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
            temperature: temp_base,
            vibration: vib_base,
            busy_with: None,
            repairing_left: 0,
            total_power_kwh: 0.0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.busy_with.is_none() && self.repairing_left == 0
    }

    /// Take a job aboard. The brief change-over between jobs sheds part of
    /// the accumulated over-base heat and vibration, scaled by the job's
    /// cooling reduction factor.
    pub fn assign(&mut self, job: Job) -> Result<(), AssignRejected> {
        if self.repairing_left > 0 {
            return Err(AssignRejected {
                job,
                reason: AssignError::Repairing,
            });
        }
        if self.busy_with.is_some() {
            return Err(AssignRejected {
                job,
                reason: AssignError::NotIdle,
            });
        }
        if job.required_class() != self.class_name {
            let required = job.required_class().to_string();
            return Err(AssignRejected {
                job,
                reason: AssignError::ClassMismatch {
                    required,
                    actual: self.class_name.clone(),
                },
            });
        }

        let temp_diff = self.temperature - self.temp_base;
        let vib_diff = self.vibration - self.vib_base;
        self.temperature -= job.reduction * temp_diff;
        self.vibration -= job.reduction * vib_diff;
        self.busy_with = Some(job);
        Ok(())
    }

    /// Advance one tick: repair countdown, or busy physics + work, or idle
    /// cooldown. Threshold breach detaches the job and arms the repair
    /// timer before any work happens this tick.
    pub fn step(&mut self, rng: &mut impl Rng, physics: &Physics) -> Option<MachineEvent> {
        if self.repairing_left > 0 {
            self.repairing_left -= 1;
            if self.repairing_left == 0 && physics.repair_idle_reset {
                self.temperature = self.temp_base;
                self.vibration = self.vib_base;
            }
            return None;
        }

        let Some(mut job) = self.busy_with.take() else {
            self.temperature = (self.temperature - IDLE_TEMP_COOLDOWN).max(self.temp_base);
            self.vibration = (self.vibration - IDLE_VIB_COOLDOWN).max(self.vib_base);
            return None;
        };

        self.temperature += job.temp_inc + rng.gen_range(BUSY_TEMP_NOISE.0..BUSY_TEMP_NOISE.1);
        self.vibration += job.vib_inc + rng.gen_range(BUSY_VIB_NOISE.0..BUSY_VIB_NOISE.1);
        self.total_power_kwh += job.current_power_kw() * physics.tick_minutes / 60.0;

        if rng.gen_range(0.0..1.0) < physics.failure_spike_prob {
            self.temperature += rng.gen_range(TEMP_SPIKE.0..TEMP_SPIKE.1);
        }
        if rng.gen_range(0.0..1.0) < physics.failure_spike_prob {
            self.vibration += rng.gen_range(VIB_SPIKE.0..VIB_SPIKE.1);
        }

        if self.temperature >= self.temp_threshold || self.vibration >= self.vib_threshold {
            self.repairing_left = self.repair_time;
            return Some(MachineEvent::Failed(job));
        }

        let before = job.remaining_ticks_on_step();
        job.work_one_tick(physics.tick_minutes);
        if job.done() {
            return Some(MachineEvent::Completed(job));
        }
        if before == 1 {
            return Some(MachineEvent::StepDone(job));
        }
        self.busy_with = Some(job);
        None
    }

    pub fn status(&self, tick: u64) -> MachineStatus {
        let status = if self.repairing_left > 0 {
            format!(
                "Repairing ({}/{})",
                self.repair_time - self.repairing_left,
                self.repair_time
            )
        } else {
            "Operational".to_string()
        };
        let current_job = if self.repairing_left > 0 {
            "REPAIR".to_string()
        } else {
            match &self.busy_with {
                Some(job) => job.label(),
                None => "IDLE".to_string(),
            }
        };
        MachineStatus {
            timestamp: tick,
            machine_id: self.machine_id.clone(),
            class_name: self.class_name.clone(),
            temperature: round2(self.temperature),
            vibration: round2(self.vibration),
            status,
            current_job,
            temp_threshold: self.temp_threshold,
            vib_threshold: self.vib_threshold,
            power_kwh_total: self.total_power_kwh,
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
