//! Sparse linear solver service for the per-timestep systems.
//!
//! A solver is initialized with a CSR matrix (`sprs::CsMat`) and then asked to solve against one or more
//! right-hand sides. Re-initializing with a matrix identical to the current one skips
//! refactorization, which matters when the generator is cached and the penalty mask has
//! not moved.
//!
//! # Backends
//!
//! [`BiCgStabSolver`]: `sprs`'s stabilized bi-conjugate gradient method, applied to the
//! Jacobi-scaled system `D^{-1} A x = D^{-1} b` with `D = diag(A)`. The scaling brings the
//! penalty rows, whose diagonal carries the penalty weight, back to unit size.
//!
//! [`LuSolver`]: `faer`'s sparse LU with partial pivoting. The symbolic analysis is kept
//! while the sparsity pattern is unchanged, so a moving penalty mask over a fixed
//! stencil only pays for the numeric factorization.

use faer::prelude::SpSolver;
use faer::sparse::linalg::solvers::{Lu, SymbolicLu};
use faer::sparse::SparseColMat;
use faer::Mat;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use sprs::linalg::bicgstab::BiCGSTAB;
use sprs::{CsMat, CsVec};
use thiserror::Error;
use tracing::trace;

/// Failures of a linear solve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinearSolverError {
    #[error("factorization failed: {0}")]
    Factorization(String),
    #[error("no convergence after {iterations} iterations (relative residual {residual:e})")]
    Divergence { iterations: usize, residual: f64 },
    #[error("solve called before initialize")]
    Uninitialized,
    #[error("dimension mismatch: matrix is {rows}x{cols}, vector has {len} entries")]
    DimensionMismatch { rows: usize, cols: usize, len: usize },
}

impl LinearSolverError {
    /// Iterations spent before failing, zero for non-iterative failures.
    pub fn iterations(&self) -> usize {
        match self {
            Self::Divergence { iterations, .. } => *iterations,
            _ => 0,
        }
    }
}

/// Solver selection, serializable as part of the solver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    /// Jacobi-scaled BiCGSTAB.
    #[default]
    BiCgStab,
    /// Sparse direct LU factorization.
    Lu,
}

impl LinearSolverKind {
    /// Creates a fresh solver instance.
    pub fn build(self, tolerance: f64, max_iterations: usize) -> Box<dyn LinearSolver> {
        match self {
            Self::BiCgStab => Box::new(BiCgStabSolver::new(tolerance, max_iterations)),
            Self::Lu => Box::new(LuSolver::new()),
        }
    }
}

/// Linear solver with a reusable factorization.
pub trait LinearSolver {
    /// Installs `matrix`, factoring it unless it equals the matrix already installed.
    fn initialize(&mut self, matrix: CsMat<f64>) -> Result<(), LinearSolverError>;

    /// Solves the installed system against `rhs`, starting from `guess` when iterative.
    fn solve(
        &mut self,
        rhs: &DVector<f64>,
        guess: &DVector<f64>,
    ) -> Result<DVector<f64>, LinearSolverError>;

    /// Iteration counts of every successful solve so far; empty for direct solvers.
    fn iterations(&self) -> &[usize];

    fn matrix(&self) -> Option<&CsMat<f64>>;
}

/// Structural and numerical equality of two CSR matrices.
pub fn same_matrix(a: &CsMat<f64>, b: &CsMat<f64>) -> bool {
    same_pattern(a, b) && a.data() == b.data()
}

/// Equality of the sparsity patterns, ignoring the stored values.
pub fn same_pattern(a: &CsMat<f64>, b: &CsMat<f64>) -> bool {
    a.shape() == b.shape()
        && a.is_csr() == b.is_csr()
        && a.proper_indptr() == b.proper_indptr()
        && a.indices() == b.indices()
}

/// `A x` for a CSR matrix.
pub fn multiply(matrix: &CsMat<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(matrix.rows());
    for (i, row) in matrix.outer_iterator().enumerate() {
        out[i] = row.iter().map(|(j, &a)| a * x[j]).sum();
    }
    out
}

fn check_dimensions(matrix: &CsMat<f64>, len: usize) -> Result<(), LinearSolverError> {
    if matrix.rows() != len || matrix.cols() != len {
        return Err(LinearSolverError::DimensionMismatch {
            rows: matrix.rows(),
            cols: matrix.cols(),
            len,
        });
    }
    if !matrix.is_csr() {
        return Err(LinearSolverError::Factorization(
            "expected a CSR matrix".to_string(),
        ));
    }
    Ok(())
}

fn check_finite(x: &DVector<f64>) -> Result<(), LinearSolverError> {
    if x.iter().any(|v| !v.is_finite()) {
        return Err(LinearSolverError::Factorization(
            "solution contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Jacobi-scaled BiCGSTAB.
#[derive(Debug, Clone)]
pub struct BiCgStabSolver {
    tolerance: f64,
    max_iterations: usize,
    matrix: Option<CsMat<f64>>,
    scaled: Option<CsMat<f64>>,
    inverse_diagonal: Vec<f64>,
    iterations: Vec<usize>,
}

impl BiCgStabSolver {
    /// `tolerance` is relative to `||D^{-1} b||`.
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations: max_iterations.max(1),
            matrix: None,
            scaled: None,
            inverse_diagonal: Vec::new(),
            iterations: Vec::new(),
        }
    }
}

impl LinearSolver for BiCgStabSolver {
    fn initialize(&mut self, matrix: CsMat<f64>) -> Result<(), LinearSolverError> {
        if self.scaled.is_some() && self.matrix.as_ref().is_some_and(|m| same_matrix(m, &matrix)) {
            return Ok(());
        }
        check_dimensions(&matrix, matrix.rows())?;
        self.scaled = None;

        let mut inverse_diagonal = Vec::with_capacity(matrix.rows());
        for i in 0..matrix.rows() {
            let pivot = matrix.get(i, i).copied().unwrap_or(0.0);
            if pivot == 0.0 || !pivot.is_finite() {
                return Err(LinearSolverError::Factorization(format!(
                    "zero diagonal in row {i}"
                )));
            }
            inverse_diagonal.push(1.0 / pivot);
        }

        let row_offsets = matrix.proper_indptr();
        let mut scaled = matrix.clone();
        let values = scaled.data_mut();
        for (i, scale) in inverse_diagonal.iter().enumerate() {
            for a in &mut values[row_offsets[i]..row_offsets[i + 1]] {
                *a *= scale;
            }
        }

        self.inverse_diagonal = inverse_diagonal;
        self.scaled = Some(scaled);
        self.matrix = Some(matrix);
        Ok(())
    }

    fn solve(
        &mut self,
        rhs: &DVector<f64>,
        guess: &DVector<f64>,
    ) -> Result<DVector<f64>, LinearSolverError> {
        let scaled = self.scaled.as_ref().ok_or(LinearSolverError::Uninitialized)?;
        check_dimensions(scaled, rhs.len())?;
        check_dimensions(scaled, guess.len())?;
        let n = rhs.len();

        let b = rhs.component_mul(&DVector::from_column_slice(&self.inverse_diagonal));
        let b_norm = b.norm();
        if b_norm == 0.0 {
            self.iterations.push(0);
            return Ok(DVector::zeros(n));
        }
        let threshold = self.tolerance * b_norm;
        let relative_residual = |x: &DVector<f64>| (&b - multiply(scaled, x)).norm() / b_norm;

        if relative_residual(guess) <= self.tolerance {
            self.iterations.push(0);
            return Ok(guess.clone());
        }

        let indices: Vec<usize> = (0..n).collect();
        let b_vec = CsVec::new(n, indices.clone(), b.as_slice().to_vec());
        let x0 = CsVec::new(n, indices, guess.as_slice().to_vec());

        let outcome = BiCGSTAB::<'_, f64, _, _>::solve(
            scaled.view(),
            x0.view(),
            b_vec.view(),
            threshold,
            self.max_iterations,
        );
        let (state, converged) = match outcome {
            Ok(state) => (state, true),
            Err(state) => (state, false),
        };

        let mut x = DVector::zeros(n);
        for (i, &v) in state.x().iter() {
            x[i] = v;
        }
        let iterations = state.iteration_count();
        let residual = relative_residual(&x);
        if !converged || !residual.is_finite() {
            return Err(LinearSolverError::Divergence {
                iterations,
                residual,
            });
        }

        trace!(iterations, residual, "bicgstab converged");
        self.iterations.push(iterations);
        Ok(x)
    }

    fn iterations(&self) -> &[usize] {
        &self.iterations
    }

    fn matrix(&self) -> Option<&CsMat<f64>> {
        self.matrix.as_ref()
    }
}

/// Direct solve through a sparse LU factorization.
#[derive(Default)]
pub struct LuSolver {
    matrix: Option<CsMat<f64>>,
    symbolic: Option<SymbolicLu<usize>>,
    lu: Option<Lu<usize, f64>>,
}

impl LuSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Column-major copy of a CSR matrix.
fn to_column_major(matrix: &CsMat<f64>) -> Result<SparseColMat<usize, f64>, LinearSolverError> {
    let mut triplets = Vec::with_capacity(matrix.nnz());
    for (i, row) in matrix.outer_iterator().enumerate() {
        for (j, &a) in row.iter() {
            triplets.push((i, j, a));
        }
    }
    SparseColMat::try_new_from_triplets(matrix.rows(), matrix.cols(), &triplets)
        .map_err(|e| LinearSolverError::Factorization(format!("{e:?}")))
}

impl LinearSolver for LuSolver {
    fn initialize(&mut self, matrix: CsMat<f64>) -> Result<(), LinearSolverError> {
        if self.lu.is_some() && self.matrix.as_ref().is_some_and(|m| same_matrix(m, &matrix)) {
            return Ok(());
        }
        check_dimensions(&matrix, matrix.rows())?;
        self.lu = None;

        let column_major = to_column_major(&matrix)?;
        let reuse = self.matrix.as_ref().is_some_and(|m| same_pattern(m, &matrix));
        let symbolic = match (&self.symbolic, reuse) {
            (Some(symbolic), true) => symbolic.clone(),
            _ => {
                trace!(nnz = matrix.nnz(), "symbolic LU analysis");
                SymbolicLu::try_new(column_major.symbolic())
                    .map_err(|e| LinearSolverError::Factorization(format!("{e:?}")))?
            }
        };
        let lu = Lu::try_new_with_symbolic(symbolic.clone(), column_major.as_ref())
            .map_err(|e| LinearSolverError::Factorization(format!("{e:?}")))?;

        self.symbolic = Some(symbolic);
        self.lu = Some(lu);
        self.matrix = Some(matrix);
        Ok(())
    }

    fn solve(
        &mut self,
        rhs: &DVector<f64>,
        _guess: &DVector<f64>,
    ) -> Result<DVector<f64>, LinearSolverError> {
        let (matrix, lu) = match (&self.matrix, &self.lu) {
            (Some(matrix), Some(lu)) => (matrix, lu),
            _ => return Err(LinearSolverError::Uninitialized),
        };
        check_dimensions(matrix, rhs.len())?;
        let b = Mat::<f64>::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let solved = lu.solve(&b);
        let x = DVector::from_fn(rhs.len(), |i, _| solved.read(i, 0));
        check_finite(&x)?;
        Ok(x)
    }

    fn iterations(&self) -> &[usize] {
        &[]
    }

    fn matrix(&self) -> Option<&CsMat<f64>> {
        self.matrix.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sprs::TriMat;

    /// Nonsymmetric, diagonally dominant tridiagonal matrix.
    fn tridiagonal(n: usize) -> CsMat<f64> {
        let mut triplets = TriMat::new((n, n));
        for i in 0..n {
            triplets.add_triplet(i, i, 4.0 + 0.1 * i as f64);
            if i > 0 {
                triplets.add_triplet(i, i - 1, -1.5);
            }
            if i + 1 < n {
                triplets.add_triplet(i, i + 1, -0.7);
            }
        }
        triplets.to_csr()
    }

    #[test]
    fn bicgstab_matches_lu() {
        let a = tridiagonal(40);
        let b = DVector::from_fn(40, |i, _| (i as f64 * 0.3).sin() + 1.0);
        let guess = DVector::zeros(40);

        let mut iterative = BiCgStabSolver::new(1e-12, 200);
        iterative.initialize(a.clone()).unwrap();
        let x_it = iterative.solve(&b, &guess).unwrap();

        let mut direct = LuSolver::new();
        direct.initialize(a.clone()).unwrap();
        let x_lu = direct.solve(&b, &guess).unwrap();

        for i in 0..40 {
            assert_relative_eq!(x_it[i], x_lu[i], epsilon = 1e-9);
        }
        let residual = (&b - multiply(&a, &x_it)).norm() / b.norm();
        assert!(residual < 1e-10);
        assert_eq!(iterative.iterations().len(), 1);
        assert!(direct.iterations().is_empty());
    }

    #[test]
    fn exact_guess_takes_zero_iterations() {
        let a = tridiagonal(10);
        let x = DVector::from_element(10, 2.0);
        let b = multiply(&a, &x);
        let mut solver = BiCgStabSolver::new(1e-10, 50);
        solver.initialize(a).unwrap();
        let solved = solver.solve(&b, &x).unwrap();
        assert_eq!(solver.iterations(), &[0]);
        assert_eq!(solved, x);
    }

    #[test]
    fn zero_rhs_returns_zero() {
        let mut solver = BiCgStabSolver::new(1e-10, 50);
        solver.initialize(tridiagonal(5)).unwrap();
        let x = solver
            .solve(&DVector::zeros(5), &DVector::from_element(5, 3.0))
            .unwrap();
        assert_eq!(x, DVector::zeros(5));
    }

    #[test]
    fn singular_matrix_is_reported() {
        let mut triplets = TriMat::new((2, 2));
        triplets.add_triplet(0, 0, 1.0);
        triplets.add_triplet(0, 1, 1.0);
        triplets.add_triplet(1, 0, 1.0);
        triplets.add_triplet(1, 1, 1.0);
        let singular: CsMat<f64> = triplets.to_csr();

        let b = DVector::from_vec(vec![1.0, 2.0]);
        let mut direct = LuSolver::new();
        let outcome = direct
            .initialize(singular.clone())
            .and_then(|_| direct.solve(&b, &b));
        assert!(matches!(outcome, Err(LinearSolverError::Factorization(_))));

        let mut triplets = TriMat::new((2, 2));
        triplets.add_triplet(0, 1, 1.0);
        triplets.add_triplet(1, 0, 1.0);
        let zero_diagonal: CsMat<f64> = triplets.to_csr();
        let mut iterative = BiCgStabSolver::new(1e-10, 50);
        assert!(matches!(
            iterative.initialize(zero_diagonal),
            Err(LinearSolverError::Factorization(_))
        ));
    }

    #[test]
    fn solve_before_initialize_fails() {
        let mut solver = LuSolver::new();
        let v = DVector::zeros(3);
        assert_eq!(solver.solve(&v, &v), Err(LinearSolverError::Uninitialized));
    }

    #[test]
    fn identical_matrix_is_not_refactored() {
        let a = tridiagonal(6);
        let mut solver = BiCgStabSolver::new(1e-10, 50);
        solver.initialize(a.clone()).unwrap();
        solver.initialize(a.clone()).unwrap();
        assert!(same_matrix(solver.matrix().unwrap(), &a));
        assert!(!same_matrix(&a, &tridiagonal(7)));
    }

    #[test]
    fn lu_refactors_when_only_values_change() {
        let a = tridiagonal(30);
        let mut b_matrix = a.clone();
        for v in b_matrix.data_mut() {
            *v *= 2.0;
        }
        assert!(same_pattern(&a, &b_matrix));
        assert!(!same_matrix(&a, &b_matrix));

        let rhs = DVector::from_fn(30, |i, _| 1.0 + i as f64);
        let guess = DVector::zeros(30);
        let mut solver = LuSolver::new();
        solver.initialize(a.clone()).unwrap();
        let x_a = solver.solve(&rhs, &guess).unwrap();
        solver.initialize(b_matrix.clone()).unwrap();
        let x_b = solver.solve(&rhs, &guess).unwrap();

        for i in 0..30 {
            assert_relative_eq!(x_a[i], 2.0 * x_b[i], max_relative = 1e-10);
        }
        let residual = (&rhs - multiply(&b_matrix, &x_b)).norm() / rhs.norm();
        assert!(residual < 1e-12);
    }
}
