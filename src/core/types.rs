use std::sync::Arc;

/// Coefficient of time and state only: discount, volatility, terminal payoff.
pub type StateFn = Arc<dyn Fn(f64, &[f64]) -> f64 + Send + Sync>;

/// Coefficient of time, state and a control value: drift, flows, transition map.
pub type ControlFn = Arc<dyn Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync>;

/// Packed arguments handed to coefficient functions and boundary routines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalArgs<'a> {
    /// Calendar time.
    pub time: f64,
    /// Spatial coordinates of the node.
    pub state: &'a [f64],
    /// Stochastic-control value assigned to the node (zeros under semi-Lagrangian handling).
    pub control: &'a [f64],
}

impl<'a> EvalArgs<'a> {
    pub fn new(time: f64, state: &'a [f64], control: &'a [f64]) -> Self {
        Self {
            time,
            state,
            control,
        }
    }
}

/// Arithmetic mean, NaN for an empty sample.
pub(crate) fn mean_count(samples: &[usize]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    samples.iter().sum::<usize>() as f64 / samples.len() as f64
}
