//! Policy improvement over a finite grid of stochastic-control candidates.

use nalgebra::DVector;

use crate::engines::hjbqvi::operator::{ControlAssignment, ControlledOperator, RowWorkspace};
use crate::math::grid::RectilinearGrid;

/// Pointwise policy iteration (Howard's algorithm) for the stochastic control.
#[derive(Debug, Clone)]
pub struct PolicyIteration {
    candidates: Vec<Vec<f64>>,
    controls: ControlAssignment,
}

impl PolicyIteration {
    /// Starts every node at the first candidate of `control_grid`.
    pub fn new(control_grid: &RectilinearGrid, nodes: usize) -> Self {
        let candidates = control_grid.nodes();
        let controls = ControlAssignment::uniform(nodes, &candidates[0]);
        Self {
            candidates,
            controls,
        }
    }

    /// Picks, at every node, the candidate minimizing `(A(q) u - b(q))_i`.
    ///
    /// Ties keep the first candidate in grid order.
    pub fn improve(&mut self, operator: &ControlledOperator<'_>, time: f64, iterate: &DVector<f64>) {
        let mut row = RowWorkspace::new(operator.grid().dimension());
        for node in 0..self.controls.nodes() {
            let mut best = f64::INFINITY;
            let mut best_index = 0;
            for (k, candidate) in self.candidates.iter().enumerate() {
                operator.fill_row(time, node, candidate, &mut row);
                let value = row.residual(node, iterate);
                if value < best {
                    best = value;
                    best_index = k;
                }
            }
            self.controls.set(node, &self.candidates[best_index]);
        }
    }

    pub fn controls(&self) -> &ControlAssignment {
        &self.controls
    }
}

/// `max_i |a_i - b_i| / max(1, |a_i|)`.
pub fn relative_error(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs() / x.abs().max(1.0))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::hjbqvi::problem::Hjbqvi;
    use crate::math::grid::Axis;

    #[test]
    fn picks_drift_towards_higher_values() {
        let problem = Hjbqvi::builder()
            .spatial_axis(Axis::uniform(0.0, 4.0, 5).unwrap())
            .stochastic_control_axis(Axis::new(vec![-1.0, 0.0, 1.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .volatility(0, |_, _| 0.5)
            .controlled_drift(0, |_, _, q| q[0])
            .exit_function(|_, _| 0.0)
            .build()
            .unwrap();
        let operator = ControlledOperator::new(&problem, problem.spatial_grid());
        let mut policy = PolicyIteration::new(problem.stochastic_control_grid(), 5);
        assert_eq!(policy.controls().at(2), &[-1.0]);

        // Increasing iterate: the maximizing drift is +1 at interior nodes.
        let u = DVector::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        policy.improve(&operator, 0.0, &u);
        for node in 1..4 {
            assert_eq!(policy.controls().at(node), &[1.0]);
        }
        // Boundary rows do not depend on the control: the first candidate wins the tie.
        assert_eq!(policy.controls().at(0), &[-1.0]);
    }

    #[test]
    fn relative_error_is_floored_at_one() {
        let a = DVector::from_vec(vec![0.5, 10.0]);
        let b = DVector::from_vec(vec![0.4, 9.0]);
        assert!((relative_error(&a, &b) - 0.1).abs() < 1e-12);
        assert_eq!(relative_error(&a, &a), 0.0);
    }
}
