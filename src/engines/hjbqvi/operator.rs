//! Monotone finite-difference discretization of the controlled generator.
//!
//! For node `i` interior along dimension `d`, with `dxb = x_i - x_{i-1}`,
//! `dxf = x_{i+1} - x_i` and `dxc = x_{i+1} - x_{i-1}`:
//!
//! ```text
//! alpha = v^2 / (dxb dxc) - mu / dxc        (coefficient on x_{i-1})
//! beta  = v^2 / (dxf dxc) + mu / dxc        (coefficient on x_{i+1})
//! ```
//!
//! falling back to a forward difference for the drift when `alpha < 0` and to a backward
//! difference when `beta < 0`, so both stay nonnegative. The row of `A` carries
//! `sum(alpha + beta) + rho` on the diagonal and `-alpha`, `-beta` off it, which makes
//! `A` an M-matrix whenever `rho >= 0`.

use std::borrow::Cow;

use nalgebra::DVector;
use sprs::{CsMat, TriMat};

use crate::core::EvalArgs;
use crate::engines::hjbqvi::boundary::{BoundaryContext, BoundarySide};
use crate::engines::hjbqvi::problem::Hjbqvi;
use crate::math::grid::RectilinearGrid;

/// Per-node control values, stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlAssignment {
    dimension: usize,
    values: Vec<f64>,
}

impl ControlAssignment {
    /// Every node assigned `control`.
    pub fn uniform(nodes: usize, control: &[f64]) -> Self {
        let mut values = Vec::with_capacity(nodes * control.len());
        for _ in 0..nodes {
            values.extend_from_slice(control);
        }
        Self {
            dimension: control.len(),
            values,
        }
    }

    pub fn zeros(nodes: usize, dimension: usize) -> Self {
        Self {
            dimension,
            values: vec![0.0; nodes * dimension],
        }
    }

    #[inline]
    pub fn at(&self, node: usize) -> &[f64] {
        &self.values[node * self.dimension..(node + 1) * self.dimension]
    }

    #[inline]
    pub fn set(&mut self, node: usize, control: &[f64]) {
        self.values[node * self.dimension..(node + 1) * self.dimension].copy_from_slice(control);
    }

    pub fn nodes(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.values.len() / self.dimension
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// One vector per control dimension, each holding a value per node.
    pub fn to_vectors(&self) -> Vec<DVector<f64>> {
        let nodes = self.nodes();
        (0..self.dimension)
            .map(|k| DVector::from_fn(nodes, |node, _| self.values[node * self.dimension + k]))
            .collect()
    }
}

/// Nonnegative `(alpha, beta)` coefficients on the backward and forward neighbors.
#[inline]
pub fn monotone_coefficients(volatility: f64, drift: f64, dxb: f64, dxf: f64) -> (f64, f64) {
    let dxc = dxb + dxf;
    let v2 = volatility * volatility;
    let alpha_common = v2 / (dxb * dxc);
    let beta_common = v2 / (dxf * dxc);

    let alpha = alpha_common - drift / dxc;
    let beta = beta_common + drift / dxc;
    if alpha < 0.0 {
        (alpha_common, beta_common + drift / dxf)
    } else if beta < 0.0 {
        (alpha_common - drift / dxb, beta_common)
    } else {
        (alpha, beta)
    }
}

/// Scratch buffers for assembling one row.
#[derive(Debug, Clone)]
pub(crate) struct RowWorkspace {
    index: Vec<usize>,
    point: Vec<f64>,
    pub diagonal: f64,
    pub neighbors: Vec<(usize, f64)>,
    pub source: f64,
}

impl RowWorkspace {
    pub fn new(dimension: usize) -> Self {
        Self {
            index: vec![0; dimension],
            point: vec![0.0; dimension],
            diagonal: 0.0,
            neighbors: Vec::with_capacity(2 * dimension),
            source: 0.0,
        }
    }

    /// `(A u)_i - b_i` for the row currently held.
    pub fn residual(&self, node: usize, u: &DVector<f64>) -> f64 {
        let off: f64 = self.neighbors.iter().map(|&(j, a)| a * u[j]).sum();
        self.diagonal * u[node] + off - self.source
    }
}

/// Generator `A(q)` and source `b(q)` of the controlled diffusion on a spatial grid.
#[derive(Clone, Copy)]
pub struct ControlledOperator<'a> {
    problem: &'a Hjbqvi,
    grid: &'a RectilinearGrid,
    semi_lagrangian: bool,
}

impl<'a> ControlledOperator<'a> {
    pub fn new(problem: &'a Hjbqvi, grid: &'a RectilinearGrid) -> Self {
        Self {
            problem,
            grid,
            semi_lagrangian: problem.handling().semi_lagrangian(),
        }
    }

    pub fn grid(&self) -> &'a RectilinearGrid {
        self.grid
    }

    /// Fills `row` with the stencil of `node` under `control`.
    pub(crate) fn fill_row(&self, time: f64, node: usize, control: &[f64], row: &mut RowWorkspace) {
        self.grid.multi_index(node, &mut row.index);
        self.grid.point(node, &mut row.point);
        row.neighbors.clear();

        let strides = self.grid.strides();
        let mut total = 0.0;
        for (d, &stride) in strides.iter().enumerate() {
            let axis = self.grid.axis(d);
            let i = row.index[d];
            let last = axis.len() - 1;

            if i == 0 || i == last {
                let side = if i == 0 {
                    BoundarySide::Left
                } else {
                    BoundarySide::Right
                };
                if let Some(routine) = self.problem.boundary(side, d) {
                    let ctx = BoundaryContext {
                        problem: self.problem,
                        grid: self.grid,
                        dimension: d,
                        side,
                        args: EvalArgs::new(time, &row.point, control),
                        node,
                        index: &row.index,
                    };
                    let stencil = routine(&ctx);
                    total += stencil.diagonal;
                    let inward = ctx.inward_neighbor().filter(|_| stencil.neighbor != 0.0);
                    if let Some(column) = inward {
                        row.neighbors.push((column, stencil.neighbor));
                    }
                }
                continue;
            }

            let dxb = axis[i] - axis[i - 1];
            let dxf = axis[i + 1] - axis[i];
            let volatility = self.problem.volatility(d, time, &row.point);
            let drift = if self.semi_lagrangian {
                0.0
            } else {
                self.problem.controlled_drift(d, time, &row.point, control)
            };
            let (alpha, beta) = monotone_coefficients(volatility, drift, dxb, dxf);
            row.neighbors.push((node - stride, -alpha));
            row.neighbors.push((node + stride, -beta));
            total += alpha + beta;
        }

        row.diagonal = total + self.problem.discount(time, &row.point);
        row.source = if self.semi_lagrangian {
            0.0
        } else {
            self.problem.controlled_flow(time, &row.point, control)
        };
    }

    /// Sparse generator `A(q)`.
    pub fn generator(&self, time: f64, controls: &ControlAssignment) -> CsMat<f64> {
        self.discretize(time, controls).0
    }

    /// Source vector `b(q)`; identically zero under semi-Lagrangian handling.
    pub fn source(&self, time: f64, controls: &ControlAssignment) -> DVector<f64> {
        if self.semi_lagrangian {
            return self.grid.zeros();
        }
        let mut row = RowWorkspace::new(self.grid.dimension());
        DVector::from_fn(self.grid.size(), |node, _| {
            self.fill_row(time, node, controls.at(node), &mut row);
            row.source
        })
    }

    /// Generator and source in one pass over the grid.
    pub fn discretize(
        &self,
        time: f64,
        controls: &ControlAssignment,
    ) -> (CsMat<f64>, DVector<f64>) {
        let n = self.grid.size();
        let mut triplets = TriMat::with_capacity((n, n), n * (1 + 2 * self.grid.dimension()));
        let mut source = DVector::zeros(n);
        let mut row = RowWorkspace::new(self.grid.dimension());
        for node in 0..n {
            self.fill_row(time, node, controls.at(node), &mut row);
            triplets.add_triplet(node, node, row.diagonal);
            for &(column, value) in &row.neighbors {
                triplets.add_triplet(node, column, value);
            }
            source[node] = row.source;
        }
        (triplets.to_csr(), source)
    }

    /// `(A(q) u)_i - b(q)_i`: the quantity minimized by policy iteration.
    pub fn local_hamiltonian(
        &self,
        time: f64,
        node: usize,
        control: &[f64],
        u: &DVector<f64>,
    ) -> f64 {
        let mut row = RowWorkspace::new(self.grid.dimension());
        self.fill_row(time, node, control, &mut row);
        row.residual(node, u)
    }
}

/// Where the generator comes from on each solve.
pub enum GeneratorSource<'a> {
    /// Computed once: time-independent coefficients under semi-Lagrangian handling, where
    /// the generator depends on neither time nor control.
    Cached(CsMat<f64>),
    /// Rebuilt for every time and control assignment.
    Recomputed(Box<dyn Fn(f64, &ControlAssignment) -> CsMat<f64> + 'a>),
}

impl<'a> GeneratorSource<'a> {
    pub fn new(problem: &'a Hjbqvi, grid: &'a RectilinearGrid) -> Self {
        let operator = ControlledOperator::new(problem, grid);
        let config = problem.config();
        if config.handling.semi_lagrangian() && config.time_independent_coefficients {
            let controls = ControlAssignment::zeros(
                grid.size(),
                problem.stochastic_control_grid().dimension(),
            );
            Self::Cached(operator.generator(0.0, &controls))
        } else {
            Self::Recomputed(Box::new(move |time, controls| {
                operator.generator(time, controls)
            }))
        }
    }

    pub fn generator(&self, time: f64, controls: &ControlAssignment) -> Cow<'_, CsMat<f64>> {
        match self {
            Self::Cached(matrix) => Cow::Borrowed(matrix),
            Self::Recomputed(build) => Cow::Owned(build(time, controls)),
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::engines::hjbqvi::boundary::{
        BoundaryStencil, linear_boundary, zero_diffusion_right_boundary,
    };
    use crate::engines::hjbqvi::config::Handling;
    use crate::math::grid::Axis;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn problem(handling: Handling) -> Hjbqvi {
        Hjbqvi::builder()
            .spatial_axis(Axis::uniform(0.0, 4.0, 5).unwrap())
            .stochastic_control_axis(Axis::new(vec![-1.0, 1.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .volatility(0, |_, _| 1.0)
            .controlled_drift(0, |_, _, q| q[0])
            .controlled_flow(|_, x, q| x[0] + q[0])
            .exit_function(|_, _| 0.0)
            .handling(handling)
            .build()
            .unwrap()
    }

    /// Nonzero entries of row `i`.
    fn row_of(matrix: &CsMat<f64>, i: usize) -> Vec<(usize, f64)> {
        matrix
            .outer_view(i)
            .map(|row| {
                row.iter()
                    .filter(|&(_, &a)| a != 0.0)
                    .map(|(j, &a)| (j, a))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn central_differences_without_drift_are_symmetric() {
        let (alpha, beta) = monotone_coefficients(2.0, 0.0, 1.0, 1.0);
        assert_relative_eq!(alpha, beta, epsilon = 1e-14);
        assert_relative_eq!(alpha, 2.0, epsilon = 1e-14);
    }

    #[test]
    fn strong_drift_switches_to_upwinding() {
        let (alpha, beta) = monotone_coefficients(0.1, 5.0, 1.0, 1.0);
        assert_relative_eq!(alpha, 0.01 / 2.0, epsilon = 1e-14);
        assert_relative_eq!(beta, 0.01 / 2.0 + 5.0, epsilon = 1e-14);

        let (alpha, beta) = monotone_coefficients(0.1, -5.0, 1.0, 1.0);
        assert_relative_eq!(alpha, 0.01 / 2.0 + 5.0, epsilon = 1e-14);
        assert_relative_eq!(beta, 0.01 / 2.0, epsilon = 1e-14);
    }

    proptest! {
        #[test]
        fn coefficients_are_nonnegative(
            volatility in -10.0f64..10.0,
            drift in -100.0f64..100.0,
            dxb in 0.01f64..10.0,
            dxf in 0.01f64..10.0,
        ) {
            let (alpha, beta) = monotone_coefficients(volatility, drift, dxb, dxf);
            prop_assert!(alpha >= 0.0);
            prop_assert!(beta >= 0.0);
        }
    }

    #[test]
    fn black_scholes_weights_are_nonnegative_on_the_clustered_axis() {
        let (rate, volatility) = (0.04, 0.2);
        let problem = crate::problems::black_scholes_call(rate, volatility, 100.0, 1.0, 1)
            .unwrap()
            .build()
            .unwrap();

        for level in 0..=2 {
            let grid = problem.spatial_grid().refined(level);
            let ticks = grid.axis(0).ticks();
            for i in 1..ticks.len() - 1 {
                let x = ticks[i];
                let (dxb, dxf) = (x - ticks[i - 1], ticks[i + 1] - x);
                let (alpha, beta) =
                    monotone_coefficients(volatility * x, rate * x, dxb, dxf);
                assert!(alpha >= 0.0, "alpha {alpha} at x = {x}, level {level}");
                assert!(beta >= 0.0, "beta {beta} at x = {x}, level {level}");
            }

            let operator = ControlledOperator::new(&problem, &grid);
            let controls = ControlAssignment::uniform(grid.size(), &[0.0]);
            let (a, _) = operator.discretize(0.0, &controls);
            for i in 1..ticks.len() - 1 {
                assert!(
                    row_of(&a, i).iter().filter(|e| e.0 != i).all(|e| e.1 <= 0.0),
                    "positive off-diagonal in row {i}, level {level}"
                );
            }
        }
    }

    #[test]
    fn generator_rows_are_diagonally_dominant() {
        let problem = problem(Handling::PENALTY);
        let operator = ControlledOperator::new(&problem, problem.spatial_grid());
        let controls = ControlAssignment::uniform(5, &[1.0]);
        let (a, b) = operator.discretize(0.0, &controls);

        for i in 0..5 {
            let row = row_of(&a, i);
            let diagonal = row.iter().find(|e| e.0 == i).map_or(0.0, |e| e.1);
            let off: f64 = row.iter().filter(|e| e.0 != i).map(|e| e.1).sum();
            assert!(row.iter().filter(|e| e.0 != i).all(|e| e.1 <= 0.0));
            assert_relative_eq!(diagonal, -off, epsilon = 1e-12);
        }
        // Boundary rows without a routine carry only the (zero) discount.
        assert!(row_of(&a, 0).is_empty());
        assert_relative_eq!(b[2], 3.0, epsilon = 1e-14);
    }

    #[test]
    fn semi_lagrangian_drops_drift_and_source() {
        let problem = problem(Handling::SEMI_LAGRANGIAN);
        let operator = ControlledOperator::new(&problem, problem.spatial_grid());
        let controls = ControlAssignment::uniform(5, &[1.0]);
        let (a, b) = operator.discretize(0.0, &controls);
        let row = row_of(&a, 2);
        assert_relative_eq!(row[0].1, -0.5, epsilon = 1e-14);
        assert_relative_eq!(row[2].1, -0.5, epsilon = 1e-14);
        assert_eq!(b, DVector::zeros(5));
        assert_eq!(operator.source(0.0, &controls), DVector::zeros(5));
    }

    #[test]
    fn local_hamiltonian_matches_assembled_residual() {
        let problem = problem(Handling::PENALTY);
        let operator = ControlledOperator::new(&problem, problem.spatial_grid());
        let u = DVector::from_vec(vec![0.0, 1.0, 4.0, 9.0, 16.0]);
        let controls = ControlAssignment::uniform(5, &[-1.0]);
        let (a, b) = operator.discretize(0.0, &controls);
        let residual = crate::math::linear_solver::multiply(&a, &u) - b;
        for i in 0..5 {
            assert_relative_eq!(
                operator.local_hamiltonian(0.0, i, &[-1.0], &u),
                residual[i],
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn boundary_routines_place_inward_entries() {
        let problem = Hjbqvi::builder()
            .spatial_axis(Axis::uniform(1.0, 5.0, 5).unwrap())
            .stochastic_control_axis(Axis::new(vec![0.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .controlled_drift(0, |_, x, _| -0.5 * x[0])
            .left_boundary(0, linear_boundary)
            .right_boundary(0, zero_diffusion_right_boundary)
            .exit_function(|_, _| 0.0)
            .build()
            .unwrap();
        let operator = ControlledOperator::new(&problem, problem.spatial_grid());
        let a = operator.generator(0.0, &ControlAssignment::zeros(5, 1));

        // Left: -mu / x = 0.5 on the diagonal only.
        assert_eq!(row_of(&a, 0), vec![(0, 0.5)]);
        // Right: alpha = -mu / dxb = 2.5, neighbor -2.5 on row - stride.
        assert_eq!(row_of(&a, 4), vec![(3, -2.5), (4, 2.5)]);
    }

    #[test]
    fn boundary_context_reports_strides_and_inward_neighbors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let problem = Hjbqvi::builder()
            .spatial_axis(Axis::uniform(0.0, 2.0, 3).unwrap())
            .spatial_axis(Axis::uniform(0.0, 3.0, 4).unwrap())
            .stochastic_control_axis(Axis::new(vec![0.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .right_boundary(1, move |ctx| {
                record
                    .lock()
                    .unwrap()
                    .push((ctx.node, ctx.stride(), ctx.inward_neighbor()));
                BoundaryStencil {
                    diagonal: 1.0,
                    neighbor: -1.0,
                }
            })
            .exit_function(|_, _| 0.0)
            .build()
            .unwrap();
        let operator = ControlledOperator::new(&problem, problem.spatial_grid());
        let a = operator.generator(0.0, &ControlAssignment::zeros(12, 1));

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        // The right face of dimension 1 holds nodes 9..12; its inward neighbors are 6..9.
        assert_eq!(
            seen,
            vec![(9, 3, Some(6)), (10, 3, Some(7)), (11, 3, Some(8))]
        );
        assert!(row_of(&a, 10).contains(&(7, -1.0)));
    }

    #[test]
    fn cached_generator_only_under_time_independent_semi_lagrangian() {
        let recomputed = problem(Handling::SEMI_LAGRANGIAN);
        let source = GeneratorSource::new(&recomputed, recomputed.spatial_grid());
        assert!(!source.is_cached());

        let mut config = recomputed.config().clone();
        config.time_independent_coefficients = true;
        let cached = Hjbqvi::builder()
            .spatial_axis(Axis::uniform(0.0, 4.0, 5).unwrap())
            .stochastic_control_axis(Axis::new(vec![-1.0, 1.0]).unwrap())
            .impulse_control_axis(Axis::new(vec![0.0]).unwrap())
            .expiry(1.0)
            .timesteps(1)
            .volatility(0, |_, _| 1.0)
            .exit_function(|_, _| 0.0)
            .config(config)
            .build()
            .unwrap();
        let source = GeneratorSource::new(&cached, cached.spatial_grid());
        assert!(source.is_cached());
        let controls = ControlAssignment::zeros(5, 1);
        let direct = ControlledOperator::new(&cached, cached.spatial_grid()).generator(3.0, &controls);
        assert!(crate::math::linear_solver::same_matrix(
            &source.generator(3.0, &controls),
            &direct
        ));
    }
}
