//! Backward time grid: constant steps or Forsyth-style adaptive steps.

use nalgebra::DVector;

/// Position of a [`ReverseStepper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepperState {
    NotStarted,
    /// Inside step `n` (zero-based).
    AtStep(usize),
    Done,
    /// Adaptive stepping used up its step budget before reaching time zero.
    Exhausted,
}

/// One backward step from `from` down to `to`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub index: usize,
    pub from: f64,
    pub to: f64,
    pub dt: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StepSize {
    Constant { timesteps: usize },
    Adaptive {
        next_dt: f64,
        target: f64,
        max_steps: usize,
    },
}

/// Walks time from `expiry` down to zero.
///
/// Adaptive stepping sizes the next step from the relative change of the last one:
/// `dt_next = dt * target / max_i |u_i - v_i| / max(1, |u_i|, |v_i|)`, clamped to the time
/// remaining. A vanishing step size cannot stall the march: after `max_steps` steps the
/// stepper stops in [`StepperState::Exhausted`].
#[derive(Debug, Clone)]
pub struct ReverseStepper {
    expiry: f64,
    size: StepSize,
    state: StepperState,
    time: f64,
    last_dt: f64,
    taken: usize,
}

impl ReverseStepper {
    pub fn constant(expiry: f64, timesteps: usize) -> Self {
        Self {
            expiry,
            size: StepSize::Constant {
                timesteps: timesteps.max(1),
            },
            state: StepperState::NotStarted,
            time: expiry,
            last_dt: 0.0,
            taken: 0,
        }
    }

    pub fn adaptive(expiry: f64, initial_dt: f64, target: f64, max_steps: usize) -> Self {
        Self {
            expiry,
            size: StepSize::Adaptive {
                next_dt: initial_dt,
                target,
                max_steps,
            },
            state: StepperState::NotStarted,
            time: expiry,
            last_dt: 0.0,
            taken: 0,
        }
    }

    pub fn state(&self) -> StepperState {
        self.state
    }

    /// Time reached by the last step (`expiry` before the first).
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn steps_taken(&self) -> usize {
        self.taken
    }

    /// Moves to the next step, or to [`StepperState::Done`] once time zero is reached.
    pub fn advance(&mut self) -> Option<Step> {
        if self.state == StepperState::Exhausted {
            return None;
        }
        if self.state == StepperState::Done || self.time <= 0.0 {
            self.state = StepperState::Done;
            return None;
        }
        if let StepSize::Adaptive { max_steps, .. } = self.size {
            if self.taken >= max_steps {
                self.state = StepperState::Exhausted;
                return None;
            }
        }
        let index = self.taken;
        let from = self.time;
        let to = match self.size {
            StepSize::Constant { timesteps } => {
                if index + 1 >= timesteps {
                    0.0
                } else {
                    self.expiry * (1.0 - (index + 1) as f64 / timesteps as f64)
                }
            }
            StepSize::Adaptive { next_dt, .. } => {
                let to = from - next_dt;
                // Avoid a sliver of a final step.
                if to <= 1e-12 * self.expiry { 0.0 } else { to }
            }
        };
        self.time = to;
        self.last_dt = from - to;
        self.taken += 1;
        self.state = StepperState::AtStep(index);
        Some(Step {
            index,
            from,
            to,
            dt: from - to,
        })
    }

    /// Feeds back the solution before and after the last step (adaptive mode only).
    pub fn accept(&mut self, before: &DVector<f64>, after: &DVector<f64>) {
        let remaining = self.time;
        let last_dt = self.last_dt;
        if let StepSize::Adaptive {
            next_dt, target, ..
        } = &mut self.size
        {
            let change = after
                .iter()
                .zip(before.iter())
                .map(|(a, b)| (a - b).abs() / a.abs().max(b.abs()).max(1.0))
                .fold(0.0, f64::max);
            let proposed = if change > 0.0 {
                last_dt * *target / change
            } else {
                remaining
            };
            *next_dt = proposed.min(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_steps_end_exactly_at_zero() {
        let mut stepper = ReverseStepper::constant(1.0, 3);
        assert_eq!(stepper.state(), StepperState::NotStarted);

        let mut times = Vec::new();
        while let Some(step) = stepper.advance() {
            assert_eq!(stepper.state(), StepperState::AtStep(step.index));
            assert_relative_eq!(step.dt, step.from - step.to, epsilon = 1e-15);
            times.push(step.to);
        }
        assert_eq!(stepper.state(), StepperState::Done);
        assert_eq!(stepper.steps_taken(), 3);
        assert_relative_eq!(times[0], 2.0 / 3.0, epsilon = 1e-15);
        assert_relative_eq!(times[1], 1.0 / 3.0, epsilon = 1e-15);
        assert_eq!(times[2], 0.0);
        assert!(stepper.advance().is_none());
    }

    #[test]
    fn adaptive_steps_track_the_target_change() {
        let mut stepper = ReverseStepper::adaptive(1.0, 0.1, 0.05, 100);
        let step = stepper.advance().unwrap();
        assert_relative_eq!(step.to, 0.9, epsilon = 1e-15);

        // 10% change over dt = 0.1 with a 5% target halves the step.
        let before = DVector::from_vec(vec![10.0, 0.0]);
        let after = DVector::from_vec(vec![11.0, 0.0]);
        stepper.accept(&before, &after);
        let step = stepper.advance().unwrap();
        assert_relative_eq!(step.dt, 0.1 * 0.05 / (1.0 / 11.0), epsilon = 1e-12);

        // No change: finish in one step.
        stepper.accept(&after, &after);
        let step = stepper.advance().unwrap();
        assert_eq!(step.to, 0.0);
        assert!(stepper.advance().is_none());
        assert_eq!(stepper.steps_taken(), 3);
    }

    #[test]
    fn vanishing_adaptive_steps_exhaust_the_budget() {
        let mut stepper = ReverseStepper::adaptive(1.0, 0.1, 1e-300, 5);
        let before = DVector::from_element(3, 1.0);
        let after = DVector::from_element(3, 2.0);
        while let Some(step) = stepper.advance() {
            assert!(step.dt >= 0.0);
            stepper.accept(&before, &after);
        }
        assert_eq!(stepper.state(), StepperState::Exhausted);
        assert_eq!(stepper.steps_taken(), 5);
        assert!(stepper.time() > 0.0);
        assert!(stepper.advance().is_none());
    }
}
