//! Rectilinear (tensor-product) grids.
//!
//! Nodes are enumerated with the first dimension varying fastest, so node `n` has
//! multi-index `(i_0, ..., i_{d-1})` with `n = sum_d i_d * stride_d`,
//! `stride_0 = 1` and `stride_d = stride_{d-1} * len_{d-1}`.

use nalgebra::DVector;
use std::ops::Index;
use thiserror::Error;

/// Errors returned when constructing axes and grids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("an axis needs at least one tick")]
    EmptyAxis,
    #[error("axis ticks must be finite")]
    NonFiniteTick,
    #[error("axis ticks must be strictly increasing")]
    NotIncreasing,
    #[error("a grid needs at least one axis")]
    NoAxes,
    #[error("a uniform axis needs at least two points and lo < hi")]
    InvalidUniform,
    #[error("query coordinate along dimension {dimension} is not finite")]
    NonFiniteQuery { dimension: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum QueryLocation {
    /// Left of the first tick (or on it).
    Left,
    /// In `[ticks[i], ticks[i + 1])` with the weight of the upper tick.
    Inside(usize, f64),
    /// Right of the last tick (or on it).
    Right,
}

/// Strictly increasing, finite sequence of ticks along one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    ticks: Vec<f64>,
}

impl Axis {
    /// Validates and wraps the ticks.
    pub fn new(ticks: impl Into<Vec<f64>>) -> Result<Self, GridError> {
        let ticks = ticks.into();
        if ticks.is_empty() {
            return Err(GridError::EmptyAxis);
        }
        if ticks.iter().any(|t| !t.is_finite()) {
            return Err(GridError::NonFiniteTick);
        }
        if ticks.windows(2).any(|w| w[1] <= w[0]) {
            return Err(GridError::NotIncreasing);
        }
        Ok(Self { ticks })
    }

    /// `points` equally spaced ticks on `[lo, hi]`.
    pub fn uniform(lo: f64, hi: f64, points: usize) -> Result<Self, GridError> {
        if points < 2 || !(lo < hi) {
            return Err(GridError::InvalidUniform);
        }
        let span = hi - lo;
        let last = (points - 1) as f64;
        let mut ticks: Vec<f64> = (0..points)
            .map(|i| lo + span * i as f64 / last)
            .collect();
        ticks[points - 1] = hi;
        Self::new(ticks)
    }

    pub fn ticks(&self) -> &[f64] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// Always `false`: an axis carries at least one tick.
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn first(&self) -> f64 {
        self.ticks[0]
    }

    pub fn last(&self) -> f64 {
        self.ticks[self.ticks.len() - 1]
    }

    /// Whether `x` lies within `[first, last]`.
    pub fn contains(&self, x: f64) -> bool {
        x >= self.first() && x <= self.last()
    }

    /// Inserts a midpoint between each consecutive pair, `levels` times.
    ///
    /// An axis of `n` ticks refined once has `2n - 1` ticks; a single-tick axis is unchanged.
    pub fn refined(&self, levels: usize) -> Self {
        let mut ticks = self.ticks.clone();
        for _ in 0..levels {
            if ticks.len() < 2 {
                break;
            }
            let mut next = Vec::with_capacity(2 * ticks.len() - 1);
            for pair in ticks.windows(2) {
                next.push(pair[0]);
                next.push(0.5 * (pair[0] + pair[1]));
            }
            next.push(ticks[ticks.len() - 1]);
            ticks = next;
        }
        Self { ticks }
    }

    /// Position of a finite `x`; `NaN` and infinities have none.
    pub(crate) fn locate(&self, x: f64) -> Option<QueryLocation> {
        if !x.is_finite() {
            return None;
        }
        let n = self.ticks.len();
        if n == 1 || x <= self.ticks[0] {
            return Some(QueryLocation::Left);
        }
        if x >= self.ticks[n - 1] {
            return Some(QueryLocation::Right);
        }
        let hi = self.ticks.partition_point(|t| *t <= x);
        let lo = hi - 1;
        let w = (x - self.ticks[lo]) / (self.ticks[hi] - self.ticks[lo]);
        Some(QueryLocation::Inside(lo, w))
    }

    /// Lower bracketing index and weight of the upper tick, clamped to the axis.
    ///
    /// `None` for a non-finite `x`.
    pub(crate) fn bracket(&self, x: f64) -> Option<(usize, f64)> {
        self.locate(x).map(|location| match location {
            QueryLocation::Left => (0, 0.0),
            QueryLocation::Inside(lo, w) => (lo, w),
            QueryLocation::Right => (self.ticks.len() - 2, 1.0),
        })
    }
}

impl Index<usize> for Axis {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.ticks[index]
    }
}

/// Tensor product of one or more axes.
#[derive(Debug, Clone, PartialEq)]
pub struct RectilinearGrid {
    axes: Vec<Axis>,
    strides: Vec<usize>,
    size: usize,
}

impl RectilinearGrid {
    pub fn new(axes: Vec<Axis>) -> Result<Self, GridError> {
        if axes.is_empty() {
            return Err(GridError::NoAxes);
        }
        let mut strides = Vec::with_capacity(axes.len());
        let mut size = 1;
        for axis in &axes {
            strides.push(size);
            size *= axis.len();
        }
        Ok(Self {
            axes,
            strides,
            size,
        })
    }

    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    /// Total number of nodes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn axis(&self, dimension: usize) -> &Axis {
        &self.axes[dimension]
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Refines every axis `levels` times.
    pub fn refined(&self, levels: usize) -> Self {
        let axes: Vec<Axis> = self.axes.iter().map(|a| a.refined(levels)).collect();
        let mut strides = Vec::with_capacity(self.axes.len());
        let mut size = 1;
        for axis in &axes {
            strides.push(size);
            size *= axis.len();
        }
        Self {
            axes,
            strides,
            size,
        }
    }

    /// Writes the multi-index of `node` into `out`.
    pub fn multi_index(&self, node: usize, out: &mut [usize]) {
        let mut rest = node;
        for (slot, axis) in out.iter_mut().zip(&self.axes) {
            *slot = rest % axis.len();
            rest /= axis.len();
        }
    }

    /// Writes the coordinates of `node` into `out`.
    pub fn point(&self, node: usize, out: &mut [f64]) {
        let mut rest = node;
        for (slot, axis) in out.iter_mut().zip(&self.axes) {
            *slot = axis[rest % axis.len()];
            rest /= axis.len();
        }
    }

    /// Coordinates of every node, in node order.
    pub fn nodes(&self) -> Vec<Vec<f64>> {
        let mut point = vec![0.0; self.dimension()];
        (0..self.size)
            .map(|node| {
                self.point(node, &mut point);
                point.clone()
            })
            .collect()
    }

    /// Evaluates `f` at every node.
    pub fn image(&self, mut f: impl FnMut(&[f64]) -> f64) -> DVector<f64> {
        let mut point = vec![0.0; self.dimension()];
        DVector::from_fn(self.size, |node, _| {
            self.point(node, &mut point);
            f(&point)
        })
    }

    pub fn zeros(&self) -> DVector<f64> {
        DVector::zeros(self.size)
    }
}

impl Index<usize> for RectilinearGrid {
    type Output = Axis;

    fn index(&self, index: usize) -> &Axis {
        &self.axes[index]
    }
}
