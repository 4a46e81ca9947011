//! Assembly of the per-step linear system
//!
//! ```text
//! (shift I + scale A) u = history + scale b
//! ```
//!
//! with the impulse constraint folded in on the active rows.

use nalgebra::DVector;
use sprs::{CsMat, TriMat};

use crate::engines::hjbqvi::config::TimeScheme;
use crate::engines::hjbqvi::impulse::{ConstraintMode, ImpulseOperator, PenaltyMethod};
use crate::math::linear_solver::multiply;

/// Weights of one implicit step.
///
/// Backward Euler is `(1, dt, 1, 0)`. Variable-step BDF2 with `w = dt_n / dt_{n-1}` is
/// `((1 + 2w) / (1 + w), dt, 1 + w, w^2 / (1 + w))`. The stationary problem uses
/// `(0, 1, 0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    /// Multiplier of the identity.
    pub shift: f64,
    /// Multiplier of the generator and the source.
    pub scale: f64,
    /// Weight of the most recent solution in the history.
    pub current: f64,
    /// Weight (subtracted) of the solution before it.
    pub older: f64,
}

impl StepCoefficients {
    pub fn backward_euler(dt: f64) -> Self {
        Self {
            shift: 1.0,
            scale: dt,
            current: 1.0,
            older: 0.0,
        }
    }

    pub fn stationary() -> Self {
        Self {
            shift: 0.0,
            scale: 1.0,
            current: 0.0,
            older: 0.0,
        }
    }

    /// Coefficients for a step of size `dt`; `previous_dt` is the size of the step before,
    /// absent on the first step.
    pub fn for_scheme(scheme: TimeScheme, dt: f64, previous_dt: Option<f64>) -> Self {
        match (scheme, previous_dt) {
            (TimeScheme::Bdf2, Some(previous)) => {
                let w = dt / previous;
                Self {
                    shift: (1.0 + 2.0 * w) / (1.0 + w),
                    scale: dt,
                    current: 1.0 + w,
                    older: w * w / (1.0 + w),
                }
            }
            _ => Self::backward_euler(dt),
        }
    }

    /// `current u^n - older u^{n-1}`.
    pub fn history(&self, latest: &DVector<f64>, older: Option<&DVector<f64>>) -> DVector<f64> {
        match older {
            Some(older) if self.older != 0.0 => latest * self.current - older * self.older,
            _ => latest * self.current,
        }
    }
}

/// Residual of the unconstrained rows at `iterate`.
pub fn pde_residual(
    generator: &CsMat<f64>,
    source: &DVector<f64>,
    coefficients: StepCoefficients,
    history: &DVector<f64>,
    iterate: &DVector<f64>,
) -> DVector<f64> {
    iterate * coefficients.shift + multiply(generator, iterate) * coefficients.scale
        - history
        - source * coefficients.scale
}

/// Active impulse constraint to fold into the system.
#[derive(Debug, Clone, Copy)]
pub struct Constraint<'c, 'a> {
    pub penalty: &'c PenaltyMethod,
    pub impulse: &'c ImpulseOperator<'a>,
}

/// Builds the matrix and right-hand side of one solve.
pub fn assemble(
    generator: &CsMat<f64>,
    source: &DVector<f64>,
    coefficients: StepCoefficients,
    history: &DVector<f64>,
    constraint: Option<Constraint<'_, '_>>,
) -> (CsMat<f64>, DVector<f64>) {
    let n = generator.rows();
    let mut triplets = TriMat::with_capacity((n, n), generator.nnz() + n);
    let mut rhs = DVector::zeros(n);

    for (i, row) in generator.outer_iterator().enumerate() {
        let active = constraint.filter(|c| c.penalty.mask()[i]);
        if let Some(c) = active {
            let weight = c.penalty.weight();
            match c.penalty.mode() {
                ConstraintMode::Direct => {
                    push_impulse_row(&mut triplets, i, weight, c.impulse.stencil(i));
                    rhs[i] = weight * c.impulse.flow(i);
                    continue;
                }
                ConstraintMode::Obstacle => {
                    triplets.add_triplet(i, i, weight);
                    rhs[i] = weight * c.impulse.obstacle()[i];
                    continue;
                }
                ConstraintMode::Penalty => {}
            }
        }

        triplets.add_triplet(i, i, coefficients.shift);
        for (j, &a) in row.iter() {
            triplets.add_triplet(i, j, coefficients.scale * a);
        }
        rhs[i] = history[i] + coefficients.scale * source[i];

        if let Some(c) = active {
            let weight = c.penalty.weight();
            push_impulse_row(&mut triplets, i, weight, c.impulse.stencil(i));
            rhs[i] += weight * c.impulse.flow(i);
        }
    }

    (triplets.to_csr(), rhs)
}

/// `W (e_i - w)`; duplicates are summed on conversion.
fn push_impulse_row(triplets: &mut TriMat<f64>, i: usize, weight: f64, stencil: &[(usize, f64)]) {
    triplets.add_triplet(i, i, weight);
    for &(j, w) in stencil {
        triplets.add_triplet(i, j, -weight * w);
    }
}
