//! Simulation clock.

use otm_algebra::Real;
use otm_traits::{EngineError, Result};

/// The pair (current time, dt). Advances only through a propagator.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    time: Real,
    dt: Real,
    step: u64,
}

impl Clock {
    pub fn new(dt: Real) -> Self {
        Clock {
            time: 0.0,
            dt,
            step: 0,
        }
    }

    /// Rebuild a clock from checkpointed state.
    pub fn restore(time: Real, dt: Real, step: u64) -> Self {
        Clock { time, dt, step }
    }

    pub fn time(&self) -> Real {
        self.time
    }

    pub fn dt(&self) -> Real {
        self.dt
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn set_dt(&mut self, dt: Real) {
        self.dt = dt;
    }

    /// The propagator validates before advancing; a non-positive or
    /// non-finite dt aborts the step.
    pub fn validate(&self) -> Result<()> {
        if self.dt > 0.0 && self.dt.is_finite() {
            Ok(())
        } else {
            Err(EngineError::TimeStepInvalid { dt: self.dt })
        }
    }

    pub(crate) fn tick(&mut self) {
        self.time += self.dt;
        self.step += 1;
    }

    pub(crate) fn untick(&mut self) {
        self.time -= self.dt;
        self.step -= 1;
    }
}
