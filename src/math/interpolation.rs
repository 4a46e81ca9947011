//! Multilinear interpolation of nodal values on a rectilinear grid.
//!
//! Queries outside the grid are clamped to the boundary (flat extrapolation), which is
//! how transition maps and semi-Lagrangian foot points that leave the domain are read.
//! Non-finite coordinates are rejected with [`GridError::NonFiniteQuery`].

use nalgebra::DVector;

use crate::math::grid::{GridError, RectilinearGrid};

/// Nonzero `(node, weight)` pairs reproducing an interpolated value.
///
/// Holds at most `2^d` entries; weights are nonnegative and sum to one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterpolationStencil {
    entries: Vec<(usize, f64)>,
    brackets: Vec<(usize, f64)>,
}

impl InterpolationStencil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the stencil for `point`, reusing the allocation.
    pub fn fill(&mut self, grid: &RectilinearGrid, point: &[f64]) -> Result<(), GridError> {
        debug_assert_eq!(point.len(), grid.dimension());
        self.entries.clear();
        self.brackets.clear();
        for (dimension, &x) in point.iter().enumerate() {
            let bracket = grid
                .axis(dimension)
                .bracket(x)
                .ok_or(GridError::NonFiniteQuery { dimension })?;
            self.brackets.push(bracket);
        }

        let strides = grid.strides();
        for corner in 0..(1usize << grid.dimension()) {
            let mut node = 0;
            let mut weight = 1.0;
            for (d, &(lo, w)) in self.brackets.iter().enumerate() {
                let (index, wd) = if (corner >> d) & 1 == 1 {
                    (lo + 1, w)
                } else {
                    (lo, 1.0 - w)
                };
                if wd == 0.0 {
                    weight = 0.0;
                    break;
                }
                weight *= wd;
                node += index * strides[d];
            }
            if weight != 0.0 {
                self.entries.push((node, weight));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[(usize, f64)] {
        &self.entries
    }

    /// Weighted sum of `values` over the stencil.
    pub fn apply(&self, values: &DVector<f64>) -> f64 {
        self.entries.iter().map(|&(node, w)| w * values[node]).sum()
    }
}

/// Piecewise-multilinear view over nodal `values` on `grid`.
#[derive(Debug, Clone, Copy)]
pub struct PiecewiseLinear<'a> {
    grid: &'a RectilinearGrid,
    values: &'a DVector<f64>,
}

impl<'a> PiecewiseLinear<'a> {
    pub fn new(grid: &'a RectilinearGrid, values: &'a DVector<f64>) -> Self {
        debug_assert_eq!(grid.size(), values.len());
        Self { grid, values }
    }

    /// Interpolated value at `point`.
    pub fn interpolate(&self, point: &[f64]) -> Result<f64, GridError> {
        let mut stencil = InterpolationStencil::new();
        self.interpolate_with(point, &mut stencil)
    }

    /// Same as [`Self::interpolate`], leaving the stencil used in `scratch`.
    pub fn interpolate_with(
        &self,
        point: &[f64],
        scratch: &mut InterpolationStencil,
    ) -> Result<f64, GridError> {
        scratch.fill(self.grid, point)?;
        Ok(scratch.apply(self.values))
    }
}
