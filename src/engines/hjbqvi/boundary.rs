//! User-supplied boundary stencils on the faces of the spatial grid.
//!
//! Without a routine, a boundary node contributes nothing along that dimension (no
//! diffusion and no drift). A routine returns the diagonal contribution and the
//! coefficient on the inward neighbor, which the assembler places at `row + stride` on the
//! left face and `row - stride` on the right face.

use std::sync::Arc;

use crate::core::EvalArgs;
use crate::engines::hjbqvi::problem::Hjbqvi;
use crate::math::grid::RectilinearGrid;

/// Face of the spatial grid along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundarySide {
    Left,
    Right,
}

/// Matrix entries contributed by a boundary routine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundaryStencil {
    pub diagonal: f64,
    /// Entry on the inward neighbor along the boundary dimension.
    pub neighbor: f64,
}

/// Everything a boundary routine may inspect.
pub struct BoundaryContext<'a> {
    pub problem: &'a Hjbqvi,
    pub grid: &'a RectilinearGrid,
    pub dimension: usize,
    pub side: BoundarySide,
    pub args: EvalArgs<'a>,
    /// Flat index of the node.
    pub node: usize,
    /// Multi-index of the node.
    pub index: &'a [usize],
}

impl BoundaryContext<'_> {
    /// Drift along the boundary dimension, zero under semi-Lagrangian handling.
    pub fn drift(&self) -> f64 {
        if self.problem.handling().semi_lagrangian() {
            return 0.0;
        }
        self.problem
            .controlled_drift(self.dimension, self.args.time, self.args.state, self.args.control)
    }

    pub fn volatility(&self) -> f64 {
        self.problem
            .volatility(self.dimension, self.args.time, self.args.state)
    }

    /// Coordinate of the node along the boundary dimension.
    pub fn coordinate(&self) -> f64 {
        self.args.state[self.dimension]
    }

    /// Offset between consecutive nodes along the boundary dimension.
    pub fn stride(&self) -> usize {
        self.grid.strides()[self.dimension]
    }

    /// Flat index of the inward neighbor; `None` on a single-tick axis.
    pub fn inward_neighbor(&self) -> Option<usize> {
        if self.grid.axis(self.dimension).len() < 2 {
            return None;
        }
        Some(match self.side {
            BoundarySide::Left => self.node + self.stride(),
            BoundarySide::Right => self.node - self.stride(),
        })
    }

    /// Distance to the inward neighbor; `NaN` on a single-tick axis.
    pub fn inward_spacing(&self) -> f64 {
        let axis = self.grid.axis(self.dimension);
        let i = self.index[self.dimension];
        match self.side {
            BoundarySide::Left if axis.len() > 1 => axis[i + 1] - axis[i],
            BoundarySide::Right if axis.len() > 1 => axis[i] - axis[i - 1],
            _ => f64::NAN,
        }
    }
}

/// Boundary routine registered on one face of one dimension.
pub type BoundaryRoutine = Arc<dyn Fn(&BoundaryContext<'_>) -> BoundaryStencil + Send + Sync>;

/// Linearity condition `u_xx = 0`: the drift term reduces to `-mu u / x` on the diagonal.
///
/// Suited to payoffs that are asymptotically linear in the state, e.g. a call at a large
/// spot, where `mu = r x` makes the diagonal contribution cancel the discount.
pub fn linear_boundary(ctx: &BoundaryContext<'_>) -> BoundaryStencil {
    BoundaryStencil {
        diagonal: -ctx.drift() / ctx.coordinate(),
        neighbor: 0.0,
    }
}

/// No diffusion on the right face, drift discretized with a backward difference.
///
/// Monotone only for inward-pointing (nonpositive) drift.
pub fn zero_diffusion_right_boundary(ctx: &BoundaryContext<'_>) -> BoundaryStencil {
    let alpha = -ctx.drift() / ctx.inward_spacing();
    BoundaryStencil {
        diagonal: alpha,
        neighbor: -alpha,
    }
}
