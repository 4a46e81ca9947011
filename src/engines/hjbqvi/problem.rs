use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{ConfigError, ControlFn, StateFn};
use crate::engines::hjbqvi::boundary::{
    BoundaryContext, BoundaryRoutine, BoundarySide, BoundaryStencil,
};
use crate::engines::hjbqvi::config::{Handling, SolverConfig, TimeScheme};
use crate::math::grid::{Axis, RectilinearGrid};
use crate::math::linear_solver::LinearSolverKind;

/// An HJB quasi-variational inequality together with its numerical settings.
///
/// The value function `u(t, x)` satisfies, backward from `u(T, x) = exit(T, x)`,
///
/// ```text
/// min( -u_t - sup_q [ 1/2 sum_d v_d^2 u_{x_d x_d} + sum_d mu_d(q) u_{x_d} + f(q) ] + rho u,
///      u - sup_z [ u(t, Gamma(x, z)) + K(x, z) ] ) = 0
/// ```
///
/// with volatility `v`, controlled drift `mu`, controlled flow `f`, discount `rho`,
/// transition `Gamma` and impulse flow `K`. An impulse flow of `-inf` forbids that
/// intervention.
///
/// Construct through [`Hjbqvi::builder`]; the builder validates every combination of
/// horizon and handling up front.
pub struct Hjbqvi {
    pub(crate) spatial_grid: RectilinearGrid,
    pub(crate) stochastic_control_grid: RectilinearGrid,
    pub(crate) impulse_control_grid: RectilinearGrid,
    pub(crate) expiry: f64,
    pub(crate) timesteps: usize,
    discount: StateFn,
    volatility: Vec<StateFn>,
    controlled_drift: Vec<ControlFn>,
    controlled_flow: ControlFn,
    transition: Vec<ControlFn>,
    impulse_flow: ControlFn,
    exit: StateFn,
    left_boundaries: Vec<Option<BoundaryRoutine>>,
    right_boundaries: Vec<Option<BoundaryRoutine>>,
    pub(crate) config: SolverConfig,
}

impl fmt::Debug for Hjbqvi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hjbqvi")
            .field("spatial_grid", &self.spatial_grid)
            .field("stochastic_control_grid", &self.stochastic_control_grid)
            .field("impulse_control_grid", &self.impulse_control_grid)
            .field("expiry", &self.expiry)
            .field("timesteps", &self.timesteps)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Hjbqvi {
    pub fn builder() -> HjbqviBuilder {
        HjbqviBuilder::default()
    }

    pub fn spatial_grid(&self) -> &RectilinearGrid {
        &self.spatial_grid
    }

    pub fn stochastic_control_grid(&self) -> &RectilinearGrid {
        &self.stochastic_control_grid
    }

    pub fn impulse_control_grid(&self) -> &RectilinearGrid {
        &self.impulse_control_grid
    }

    /// Horizon; `f64::INFINITY` for a stationary problem.
    pub fn expiry(&self) -> f64 {
        self.expiry
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn finite_horizon(&self) -> bool {
        self.expiry.is_finite()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn handling(&self) -> Handling {
        self.config.handling
    }

    pub fn dimension(&self) -> usize {
        self.spatial_grid.dimension()
    }

    #[inline]
    pub fn discount(&self, time: f64, state: &[f64]) -> f64 {
        (self.discount)(time, state)
    }

    #[inline]
    pub fn volatility(&self, dimension: usize, time: f64, state: &[f64]) -> f64 {
        (self.volatility[dimension])(time, state)
    }

    #[inline]
    pub fn controlled_drift(
        &self,
        dimension: usize,
        time: f64,
        state: &[f64],
        control: &[f64],
    ) -> f64 {
        (self.controlled_drift[dimension])(time, state, control)
    }

    #[inline]
    pub fn controlled_flow(&self, time: f64, state: &[f64], control: &[f64]) -> f64 {
        (self.controlled_flow)(time, state, control)
    }

    #[inline]
    pub fn transition(&self, dimension: usize, time: f64, state: &[f64], impulse: &[f64]) -> f64 {
        (self.transition[dimension])(time, state, impulse)
    }

    #[inline]
    pub fn impulse_flow(&self, time: f64, state: &[f64], impulse: &[f64]) -> f64 {
        (self.impulse_flow)(time, state, impulse)
    }

    #[inline]
    pub fn exit_value(&self, time: f64, state: &[f64]) -> f64 {
        (self.exit)(time, state)
    }

    pub(crate) fn boundary(&self, side: BoundarySide, dimension: usize) -> Option<&BoundaryRoutine> {
        match side {
            BoundarySide::Left => self.left_boundaries[dimension].as_ref(),
            BoundarySide::Right => self.right_boundaries[dimension].as_ref(),
        }
    }
}

/// Builder for [`Hjbqvi`].
///
/// Only the spatial axes, both control axes, the expiry and the exit function are
/// required. Unset coefficients default to zero, the transition map to the identity and
/// the impulse flow to `-inf` (no interventions).
#[derive(Default)]
pub struct HjbqviBuilder {
    spatial_axes: Vec<Axis>,
    stochastic_control_axes: Vec<Axis>,
    impulse_control_axes: Vec<Axis>,
    expiry: Option<f64>,
    timesteps: usize,
    discount: Option<StateFn>,
    volatility: BTreeMap<usize, StateFn>,
    controlled_drift: BTreeMap<usize, ControlFn>,
    controlled_flow: Option<ControlFn>,
    transition: BTreeMap<usize, ControlFn>,
    impulse_flow: Option<ControlFn>,
    exit: Option<StateFn>,
    left_boundaries: BTreeMap<usize, BoundaryRoutine>,
    right_boundaries: BTreeMap<usize, BoundaryRoutine>,
    config: SolverConfig,
}

impl HjbqviBuilder {
    /// Appends a spatial dimension.
    #[inline]
    pub fn spatial_axis(mut self, axis: Axis) -> Self {
        self.spatial_axes.push(axis);
        self
    }

    /// Appends a dimension to the stochastic-control candidate grid.
    #[inline]
    pub fn stochastic_control_axis(mut self, axis: Axis) -> Self {
        self.stochastic_control_axes.push(axis);
        self
    }

    /// Appends a dimension to the impulse-control candidate grid.
    #[inline]
    pub fn impulse_control_axis(mut self, axis: Axis) -> Self {
        self.impulse_control_axes.push(axis);
        self
    }

    /// Sets the horizon. Pass `f64::INFINITY` for a stationary problem.
    #[inline]
    pub fn expiry(mut self, expiry: f64) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Sets the number of timesteps at refinement level zero.
    #[inline]
    pub fn timesteps(mut self, timesteps: usize) -> Self {
        self.timesteps = timesteps;
        self
    }

    pub fn discount(mut self, f: impl Fn(f64, &[f64]) -> f64 + Send + Sync + 'static) -> Self {
        self.discount = Some(Arc::new(f));
        self
    }

    pub fn volatility(
        mut self,
        dimension: usize,
        f: impl Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.volatility.insert(dimension, Arc::new(f));
        self
    }

    pub fn controlled_drift(
        mut self,
        dimension: usize,
        f: impl Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.controlled_drift.insert(dimension, Arc::new(f));
        self
    }

    pub fn controlled_flow(
        mut self,
        f: impl Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.controlled_flow = Some(Arc::new(f));
        self
    }

    /// Post-impulse coordinate along `dimension` as a function of `(t, x, z)`.
    pub fn transition(
        mut self,
        dimension: usize,
        f: impl Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.transition.insert(dimension, Arc::new(f));
        self
    }

    pub fn impulse_flow(
        mut self,
        f: impl Fn(f64, &[f64], &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.impulse_flow = Some(Arc::new(f));
        self
    }

    /// Terminal condition; also the initial guess of a stationary problem.
    pub fn exit_function(
        mut self,
        f: impl Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.exit = Some(Arc::new(f));
        self
    }

    pub fn left_boundary(
        mut self,
        dimension: usize,
        routine: impl Fn(&BoundaryContext<'_>) -> BoundaryStencil + Send + Sync + 'static,
    ) -> Self {
        self.left_boundaries.insert(dimension, Arc::new(routine));
        self
    }

    pub fn right_boundary(
        mut self,
        dimension: usize,
        routine: impl Fn(&BoundaryContext<'_>) -> BoundaryStencil + Send + Sync + 'static,
    ) -> Self {
        self.right_boundaries.insert(dimension, Arc::new(routine));
        self
    }

    /// Replaces every numerical setting at once.
    #[inline]
    pub fn config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    pub fn handling(mut self, handling: Handling) -> Self {
        self.config.handling = handling;
        self
    }

    #[inline]
    pub fn linear_solver(mut self, kind: LinearSolverKind) -> Self {
        self.config.linear_solver = kind;
        self
    }

    #[inline]
    pub fn time_scheme(mut self, scheme: TimeScheme) -> Self {
        self.config.time_scheme = scheme;
        self
    }

    #[inline]
    pub fn scaling_factor(mut self, scaling_factor: f64) -> Self {
        self.config.scaling_factor = scaling_factor;
        self
    }

    #[inline]
    pub fn iteration_tolerance(mut self, tolerance: f64) -> Self {
        self.config.iteration_tolerance = tolerance;
        self
    }

    /// Enables adaptive timestepping.
    #[inline]
    pub fn target_timestep_relative_error(mut self, target: f64) -> Self {
        self.config.target_timestep_relative_error = Some(target);
        self
    }

    #[inline]
    pub fn max_timesteps(mut self, cap: usize) -> Self {
        self.config.max_timesteps = cap;
        self
    }

    #[inline]
    pub fn max_inner_iterations(mut self, cap: usize) -> Self {
        self.config.max_inner_iterations = cap;
        self
    }

    #[inline]
    pub fn max_outer_iterations(mut self, cap: usize) -> Self {
        self.config.max_outer_iterations = cap;
        self
    }

    #[inline]
    pub fn disable_stochastic_control_refinement(mut self) -> Self {
        self.config.refine_stochastic_control_grid = false;
        self
    }

    #[inline]
    pub fn disable_impulse_control_refinement(mut self) -> Self {
        self.config.refine_impulse_control_grid = false;
        self
    }

    #[inline]
    pub fn time_independent_coefficients(mut self) -> Self {
        self.config.time_independent_coefficients = true;
        self
    }

    #[inline]
    pub fn drop_off_grid_foot_points(mut self) -> Self {
        self.config.drop_off_grid_foot_points = true;
        self
    }

    /// Validates and builds the problem.
    ///
    /// # Errors
    /// Returns [`ConfigError`] for malformed grids, a non-positive expiry, zero timesteps on
    /// a finite horizon, unsupported handling combinations, bad numerical settings or
    /// coefficients registered on dimensions the spatial grid does not have.
    pub fn build(self) -> Result<Hjbqvi, ConfigError> {
        if self.spatial_axes.is_empty() {
            return Err(ConfigError::MissingField("spatial axes"));
        }
        if self.stochastic_control_axes.is_empty() {
            return Err(ConfigError::MissingField("stochastic control axes"));
        }
        if self.impulse_control_axes.is_empty() {
            return Err(ConfigError::MissingField("impulse control axes"));
        }
        let spatial_grid = RectilinearGrid::new(self.spatial_axes)?;
        let stochastic_control_grid = RectilinearGrid::new(self.stochastic_control_axes)?;
        let impulse_control_grid = RectilinearGrid::new(self.impulse_control_axes)?;
        let dims = spatial_grid.dimension();

        let expiry = self.expiry.ok_or(ConfigError::MissingField("expiry"))?;
        if !(expiry > 0.0) {
            return Err(ConfigError::NonPositiveExpiry(expiry));
        }
        let finite = expiry.is_finite();

        let config = self.config;
        config.validate()?;
        let handling = config.handling;
        if finite && self.timesteps == 0 {
            return Err(ConfigError::NonPositiveTimesteps);
        }
        if !finite && !handling.fully_implicit() {
            return Err(ConfigError::InfiniteHorizonRequiresImplicit);
        }
        if config.adaptive() && !(finite && handling.fully_implicit()) {
            return Err(ConfigError::AdaptiveTimesteppingUnsupported);
        }
        if handling.iterated_optimal_stopping() {
            if config.adaptive() {
                return Err(ConfigError::IteratedOptimalStoppingUnsupported(
                    "adaptive timestepping",
                ));
            }
            if !finite {
                return Err(ConfigError::IteratedOptimalStoppingUnsupported(
                    "an infinite horizon",
                ));
            }
            if handling.explicit_impulse() {
                return Err(ConfigError::IteratedOptimalStoppingUnsupported(
                    "an explicit impulse",
                ));
            }
            if config.time_scheme == TimeScheme::Bdf2 {
                return Err(ConfigError::IteratedOptimalStoppingUnsupported(
                    "the BDF2 time scheme",
                ));
            }
        }

        let volatility = per_dimension("volatility", self.volatility, dims, |_| {
            Arc::new(|_: f64, _: &[f64]| 0.0) as StateFn
        })?;
        let controlled_drift = per_dimension("controlled drift", self.controlled_drift, dims, |_| {
            Arc::new(|_: f64, _: &[f64], _: &[f64]| 0.0) as ControlFn
        })?;
        let transition = per_dimension("transition", self.transition, dims, |dimension| {
            Arc::new(move |_: f64, x: &[f64], _: &[f64]| x[dimension]) as ControlFn
        })?;
        let left_boundaries = optional_per_dimension("left boundary", self.left_boundaries, dims)?;
        let right_boundaries =
            optional_per_dimension("right boundary", self.right_boundaries, dims)?;

        let exit = self.exit.ok_or(ConfigError::MissingField("exit function"))?;

        Ok(Hjbqvi {
            spatial_grid,
            stochastic_control_grid,
            impulse_control_grid,
            expiry,
            timesteps: if finite { self.timesteps } else { 0 },
            discount: self
                .discount
                .unwrap_or_else(|| Arc::new(|_: f64, _: &[f64]| 0.0) as StateFn),
            volatility,
            controlled_drift,
            controlled_flow: self
                .controlled_flow
                .unwrap_or_else(|| Arc::new(|_: f64, _: &[f64], _: &[f64]| 0.0) as ControlFn),
            transition,
            impulse_flow: self
                .impulse_flow
                .unwrap_or_else(|| {
                    Arc::new(|_: f64, _: &[f64], _: &[f64]| f64::NEG_INFINITY) as ControlFn
                }),
            exit,
            left_boundaries,
            right_boundaries,
            config,
        })
    }
}

/// Dense per-dimension table, filling gaps with `default(d)`.
fn per_dimension<T>(
    what: &'static str,
    mut registered: BTreeMap<usize, T>,
    dimensions: usize,
    default: impl Fn(usize) -> T,
) -> Result<Vec<T>, ConfigError> {
    if let Some((&index, _)) = registered.range(dimensions..).next() {
        return Err(ConfigError::DimensionOutOfRange {
            what,
            index,
            dimensions,
        });
    }
    Ok((0..dimensions)
        .map(|d| registered.remove(&d).unwrap_or_else(|| default(d)))
        .collect())
}

fn optional_per_dimension<T>(
    what: &'static str,
    mut registered: BTreeMap<usize, T>,
    dimensions: usize,
) -> Result<Vec<Option<T>>, ConfigError> {
    if let Some((&index, _)) = registered.range(dimensions..).next() {
        return Err(ConfigError::DimensionOutOfRange {
            what,
            index,
            dimensions,
        });
    }
    Ok((0..dimensions).map(|d| registered.remove(&d)).collect())
}
