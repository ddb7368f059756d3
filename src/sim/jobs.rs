use rand::Rng;

/// Intensity profile applied to the machine running a step of this job.
#[derive(Debug, Clone, Copy)]
pub struct IntensityProfile {
    pub label: &'static str,
    pub temp_inc: f64,
    pub vib_inc: f64,
    pub power_kw: f64,
}

pub const INTENSITIES: [IntensityProfile; 4] = [
    IntensityProfile {
        label: "light",
        temp_inc: 3.0,
        vib_inc: 0.8,
        power_kw: 1.8,
    },
    IntensityProfile {
        label: "moderate",
        temp_inc: 4.5,
        vib_inc: 1.2,
        power_kw: 2.6,
    },
    IntensityProfile {
        label: "heavy",
        temp_inc: 5.5,
        vib_inc: 1.5,
        power_kw: 3.5,
    },
    IntensityProfile {
        label: "stress",
        temp_inc: 6.0,
        vib_inc: 2.0,
        power_kw: 4.3,
    },
];

pub const ROUTE_PATTERNS: [&[&str]; 7] = [
    &["A", "B"],
    &["A", "B", "C"],
    &["C", "A"],
    &["B", "D"],
    &["A", "C"],
    &["B", "C"],
    &["A", "A", "B"],
];

const DURATION_TOTAL_RANGE: (u32, u32) = (8, 18);
const STEP_MIN_TICKS: u32 = 2;
const POWER_VARIATION: (f64, f64) = (0.8, 1.2);
const REDUCTION_RANGE: (f64, f64) = (0.2, 0.6);

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub class: String,
    pub remaining: u32,
    pub power_kw: f64,
}

/// One routed unit of work. A job is owned by exactly one place at a time:
/// a class queue, a machine's `busy_with`, or the completed set.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: u64,
    pub intensity: &'static str,
    pub temp_inc: f64,
    pub vib_inc: f64,
    pub power_kw: f64,
    pub reduction: f64,
    pub steps: Vec<Step>,
    pub current_step: usize,
    pub energy_used: f64,
}

impl Job {
    pub fn label(&self) -> String {
        format!("JOB_{}", self.id)
    }

    pub fn done(&self) -> bool {
        self.current_step >= self.steps.len()
    }

    pub fn required_class(&self) -> &str {
        match self.steps.get(self.current_step) {
            Some(step) => &step.class,
            None => "",
        }
    }

    pub fn remaining_ticks_on_step(&self) -> u32 {
        match self.steps.get(self.current_step) {
            Some(step) => step.remaining,
            None => 0,
        }
    }

    pub fn current_power_kw(&self) -> f64 {
        match self.steps.get(self.current_step) {
            Some(step) => step.power_kw,
            None => 0.0,
        }
    }

    /// Burn one tick of the current step and accrue its energy. Advances
    /// the route cursor when the step's remaining work reaches zero.
    pub fn work_one_tick(&mut self, tick_minutes: f64) {
        let Some(step) = self.steps.get_mut(self.current_step) else {
            return;
        };
        step.remaining = step.remaining.saturating_sub(1);
        self.energy_used += step.power_kw * tick_minutes / 60.0;
        if step.remaining == 0 {
            self.current_step += 1;
        }
    }
}

/// Owns the monotonic job-id counter; randomness comes in from the caller
/// so a seeded run reproduces the same job stream.
#[derive(Debug, Default)]
pub struct JobFactory {
    next_id: u64,
}

impl JobFactory {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    pub fn make_random(&mut self, rng: &mut impl Rng) -> Job {
        self.next_id += 1;
        let profile = INTENSITIES[rng.gen_range(0..INTENSITIES.len())];
        let pattern = ROUTE_PATTERNS[rng.gen_range(0..ROUTE_PATTERNS.len())];
        let total = rng.gen_range(DURATION_TOTAL_RANGE.0..=DURATION_TOTAL_RANGE.1);

        // Every step gets the minimum, the rest of the budget lands at random.
        let mut durations = vec![STEP_MIN_TICKS; pattern.len()];
        let spare = total.saturating_sub(STEP_MIN_TICKS * pattern.len() as u32);
        for _ in 0..spare {
            let idx = rng.gen_range(0..durations.len());
            durations[idx] += 1;
        }

        let steps = pattern
            .iter()
            .zip(durations)
            .map(|(class, remaining)| Step {
                class: (*class).to_string(),
                remaining,
                power_kw: profile.power_kw * rng.gen_range(POWER_VARIATION.0..POWER_VARIATION.1),
            })
            .collect();

        Job {
            id: self.next_id,
            intensity: profile.label,
            temp_inc: profile.temp_inc,
            vib_inc: profile.vib_inc,
            power_kw: profile.power_kw,
            reduction: rng.gen_range(REDUCTION_RANGE.0..REDUCTION_RANGE.1),
            steps,
            current_step: 0,
            energy_used: 0.0,
        }
    }
}

#[cfg(test)]
pub fn fixed_job(id: u64, route: &[(&str, u32)]) -> Job {
    Job {
        id,
        intensity: "light",
        temp_inc: 3.0,
        vib_inc: 0.8,
        power_kw: 1.8,
        reduction: 0.4,
        steps: route
            .iter()
            .map(|(class, remaining)| Step {
                class: (*class).to_string(),
                remaining: *remaining,
                power_kw: 1.8,
            })
            .collect(),
        current_step: 0,
        energy_used: 0.0,
    }
}
