//! Intervention operator and the penalized / direct impulse constraint.
//!
//! The intervention operator is `M u (x) = sup_z [ u(Gamma(x, z)) + K(x, z) ]`, read from
//! the current iterate by multilinear interpolation. At the maximizer it is linear in
//! `u`: `M u = w . u + c` with interpolation weights `w` and flow `c = K`, which is what
//! lets the constraint enter the linear system as the row `e_i - w`.

use nalgebra::DVector;

use crate::engines::hjbqvi::operator::ControlAssignment;
use crate::engines::hjbqvi::problem::Hjbqvi;
use crate::math::grid::{GridError, RectilinearGrid};
use crate::math::interpolation::{InterpolationStencil, PiecewiseLinear};

/// Intervention operator with the maximizing impulse recorded per node.
#[derive(Debug, Clone)]
pub struct ImpulseOperator<'a> {
    problem: &'a Hjbqvi,
    grid: &'a RectilinearGrid,
    candidates: Vec<Vec<f64>>,
    controls: ControlAssignment,
    obstacle: DVector<f64>,
    flows: DVector<f64>,
    stencils: Vec<Vec<(usize, f64)>>,
}

impl<'a> ImpulseOperator<'a> {
    pub fn new(
        problem: &'a Hjbqvi,
        grid: &'a RectilinearGrid,
        impulse_grid: &RectilinearGrid,
    ) -> Self {
        let candidates = impulse_grid.nodes();
        let n = grid.size();
        Self {
            problem,
            grid,
            controls: ControlAssignment::uniform(n, &candidates[0]),
            candidates,
            obstacle: DVector::from_element(n, f64::NEG_INFINITY),
            flows: DVector::from_element(n, f64::NEG_INFINITY),
            stencils: vec![Vec::new(); n],
        }
    }

    /// Evaluates `M iterate` at every node, keeping the first strict maximizer.
    ///
    /// Fails when a transition lands on a non-finite state.
    pub fn improve(&mut self, time: f64, iterate: &DVector<f64>) -> Result<(), GridError> {
        let dims = self.grid.dimension();
        let interp = PiecewiseLinear::new(self.grid, iterate);
        let mut point = vec![0.0; dims];
        let mut target = vec![0.0; dims];
        let mut best_target = vec![0.0; dims];
        let mut stencil = InterpolationStencil::new();

        for node in 0..self.grid.size() {
            self.grid.point(node, &mut point);
            let mut best = f64::NEG_INFINITY;
            let mut best_index = 0;
            let mut best_flow = f64::NEG_INFINITY;
            for (k, z) in self.candidates.iter().enumerate() {
                let flow = self.problem.impulse_flow(time, &point, z);
                if flow == f64::NEG_INFINITY {
                    continue;
                }
                for (d, slot) in target.iter_mut().enumerate() {
                    *slot = self.problem.transition(d, time, &point, z);
                }
                let value = interp.interpolate_with(&target, &mut stencil)? + flow;
                if value > best {
                    best = value;
                    best_index = k;
                    best_flow = flow;
                    best_target.copy_from_slice(&target);
                }
            }

            self.controls.set(node, &self.candidates[best_index]);
            self.obstacle[node] = best;
            self.flows[node] = best_flow;
            let entries = &mut self.stencils[node];
            entries.clear();
            if best > f64::NEG_INFINITY {
                stencil.fill(self.grid, &best_target)?;
                entries.extend_from_slice(stencil.entries());
            }
        }
        Ok(())
    }

    /// `M u` at the last improved iterate; `-inf` where no intervention is admissible.
    pub fn obstacle(&self) -> &DVector<f64> {
        &self.obstacle
    }

    pub fn controls(&self) -> &ControlAssignment {
        &self.controls
    }

    /// Interpolation weights `w` of the maximizing post-impulse state.
    pub fn stencil(&self, node: usize) -> &[(usize, f64)] {
        &self.stencils[node]
    }

    /// Flow `c = K` of the maximizing impulse.
    pub fn flow(&self, node: usize) -> f64 {
        self.flows[node]
    }
}

/// How a binding impulse constraint modifies its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintMode {
    /// Adds `W (e_i - w)` to the row and `W c` to the right-hand side.
    Penalty,
    /// Replaces the row with `W (e_i - w)` and the right-hand side with `W c`.
    Direct,
    /// Replaces the row with `W e_i` and the right-hand side with `W M u`, holding the
    /// obstacle fixed at the iterand it was read from.
    Obstacle,
}

/// Active-set bookkeeping for the implicit impulse constraint.
#[derive(Debug, Clone)]
pub struct PenaltyMethod {
    mode: ConstraintMode,
    weight: f64,
    mask: Vec<bool>,
}

impl PenaltyMethod {
    pub fn new(mode: ConstraintMode, weight: f64, nodes: usize) -> Self {
        Self {
            mode,
            weight,
            mask: vec![false; nodes],
        }
    }

    pub fn mode(&self) -> ConstraintMode {
        self.mode
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    /// Nodes at which the impulse constraint currently binds.
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Recomputes the active set at `iterate`.
    ///
    /// `pde_residual` is the residual of the unconstrained row at `iterate`; the direct
    /// and obstacle modes select the row with the smaller residual.
    pub fn update_mask(
        &mut self,
        impulse: &ImpulseOperator<'_>,
        iterate: &DVector<f64>,
        pde_residual: &DVector<f64>,
    ) {
        let obstacle = impulse.obstacle();
        for (i, active) in self.mask.iter_mut().enumerate() {
            *active = match self.mode {
                ConstraintMode::Penalty => obstacle[i] > iterate[i],
                ConstraintMode::Direct | ConstraintMode::Obstacle => {
                    self.weight * (iterate[i] - obstacle[i]) < pde_residual[i]
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::grid::Axis;
    use approx::assert_relative_eq;

    /// Jump to zero for a fixed cost of 1.
    fn problem() -> Hjbqvi {
        Hjbqvi::builder()
            .spatial_axis(Axis::uniform(0.0, 4.0, 5).unwrap())
            .stochastic_control_axis(Axis::new(vec![0.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0, 0.5]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .transition(0, |_, _, z| z[0])
            .impulse_flow(|_, x, _| if x[0] > 0.0 { -1.0 } else { f64::NEG_INFINITY })
            .exit_function(|_, _| 0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn intervention_picks_the_best_target() {
        let problem = problem();
        let mut impulse = ImpulseOperator::new(
            &problem,
            problem.spatial_grid(),
            problem.impulse_control_grid(),
        );
        // u decreasing in x: jumping to 0 is best.
        let u = DVector::from_vec(vec![10.0, 8.0, 6.0, 4.0, 2.0]);
        impulse.improve(0.0, &u).unwrap();

        assert_eq!(impulse.obstacle()[0], f64::NEG_INFINITY);
        assert!(impulse.stencil(0).is_empty());
        for node in 1..5 {
            assert_relative_eq!(impulse.obstacle()[node], 9.0, epsilon = 1e-12);
            assert_eq!(impulse.controls().at(node), &[0.0]);
            assert_eq!(impulse.stencil(node), &[(0, 1.0)]);
            assert_eq!(impulse.flow(node), -1.0);
        }
    }

    #[test]
    fn interpolated_target_splits_weights() {
        let problem = problem();
        let mut impulse = ImpulseOperator::new(
            &problem,
            problem.spatial_grid(),
            problem.impulse_control_grid(),
        );
        // u increasing in x: the larger target wins.
        let u = DVector::from_vec(vec![0.0, 2.0, 4.0, 6.0, 8.0]);
        impulse.improve(0.0, &u).unwrap();
        assert_eq!(impulse.controls().at(3), &[0.5]);
        assert_relative_eq!(impulse.obstacle()[3], 0.0, epsilon = 1e-12);
        assert_eq!(impulse.stencil(3), &[(0, 0.5), (1, 0.5)]);
    }

    #[test]
    fn penalty_and_direct_masks() {
        let problem = problem();
        let mut impulse = ImpulseOperator::new(
            &problem,
            problem.spatial_grid(),
            problem.impulse_control_grid(),
        );
        let u = DVector::from_vec(vec![10.0, 8.0, 9.5, 4.0, 2.0]);
        impulse.improve(0.0, &u).unwrap();

        let mut penalty = PenaltyMethod::new(ConstraintMode::Penalty, 100.0, 5);
        penalty.update_mask(&impulse, &u, &DVector::zeros(5));
        assert_eq!(penalty.mask(), &[false, true, false, true, true]);

        // Direct: row i is constrained when W (u - Mu) < PDE residual.
        let residual = DVector::from_vec(vec![0.0, -1000.0, 100.0, 0.0, 0.0]);
        let mut direct = PenaltyMethod::new(ConstraintMode::Direct, 100.0, 5);
        direct.update_mask(&impulse, &u, &residual);
        assert_eq!(direct.mask(), &[false, false, true, true, true]);
    }

    #[test]
    fn non_finite_transition_is_an_error() {
        let problem = Hjbqvi::builder()
            .spatial_axis(Axis::uniform(0.0, 4.0, 5).unwrap())
            .stochastic_control_axis(Axis::new(vec![0.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .transition(0, |_, _, _| f64::NAN)
            .impulse_flow(|_, _, _| 0.0)
            .exit_function(|_, _| 0.0)
            .build()
            .unwrap();
        let mut impulse = ImpulseOperator::new(
            &problem,
            problem.spatial_grid(),
            problem.impulse_control_grid(),
        );
        assert_eq!(
            impulse.improve(0.0, &DVector::zeros(5)),
            Err(GridError::NonFiniteQuery { dimension: 0 })
        );
    }
}
