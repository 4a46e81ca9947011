//! Explicit event applied after each solve: semi-Lagrangian control and/or explicit
//! impulse, both read from the freshly computed values.

use nalgebra::DVector;

use crate::engines::hjbqvi::operator::ControlAssignment;
use crate::engines::hjbqvi::problem::Hjbqvi;
use crate::math::grid::{GridError, RectilinearGrid};
use crate::math::interpolation::{InterpolationStencil, PiecewiseLinear};

/// Decisions made by the last event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDecisions {
    pub stochastic_controls: ControlAssignment,
    pub impulse_controls: ControlAssignment,
    pub intervention: Vec<bool>,
}

/// Continuation value `a` against intervention value `b`: intervene iff `b >= a` and some
/// intervention is admissible.
#[inline]
pub fn combine(continuation: f64, intervention: f64) -> (f64, bool) {
    if intervention >= continuation && intervention > f64::NEG_INFINITY {
        (intervention, true)
    } else {
        (continuation, false)
    }
}

/// Explicit control event on one spatial grid.
#[derive(Debug, Clone)]
pub struct ExplicitEvent<'a> {
    problem: &'a Hjbqvi,
    grid: &'a RectilinearGrid,
    stochastic_candidates: Vec<Vec<f64>>,
    impulse_candidates: Vec<Vec<f64>>,
    semi_lagrangian: bool,
    explicit_impulse: bool,
    drop_off_grid: bool,
    decisions: EventDecisions,
}

impl<'a> ExplicitEvent<'a> {
    pub fn new(
        problem: &'a Hjbqvi,
        grid: &'a RectilinearGrid,
        stochastic_grid: &RectilinearGrid,
        impulse_grid: &RectilinearGrid,
    ) -> Self {
        let handling = problem.handling();
        let stochastic_candidates = stochastic_grid.nodes();
        let impulse_candidates = impulse_grid.nodes();
        let n = grid.size();
        let decisions = EventDecisions {
            stochastic_controls: ControlAssignment::uniform(n, &stochastic_candidates[0]),
            impulse_controls: ControlAssignment::uniform(n, &impulse_candidates[0]),
            intervention: vec![false; n],
        };
        Self {
            problem,
            grid,
            stochastic_candidates,
            impulse_candidates,
            semi_lagrangian: handling.semi_lagrangian(),
            explicit_impulse: handling.explicit_impulse(),
            drop_off_grid: problem.config().drop_off_grid_foot_points,
            decisions,
        }
    }

    pub fn decisions(&self) -> &EventDecisions {
        &self.decisions
    }

    /// Applies the event at `time` to `values`, returning the post-event values.
    ///
    /// `dt` scales the running flow of the semi-Lagrangian part; the impulse flow is paid
    /// once. Fails when a foot point or a transition is not finite.
    pub fn apply(
        &mut self,
        values: &DVector<f64>,
        time: f64,
        dt: f64,
    ) -> Result<DVector<f64>, GridError> {
        let dims = self.grid.dimension();
        let interp = PiecewiseLinear::new(self.grid, values);
        let mut point = vec![0.0; dims];
        let mut target = vec![0.0; dims];
        let mut stencil = InterpolationStencil::new();
        let mut out = values.clone();

        for node in 0..self.grid.size() {
            self.grid.point(node, &mut point);

            let continuation = if self.semi_lagrangian {
                let mut best = f64::NEG_INFINITY;
                let mut best_index = 0;
                for (k, q) in self.stochastic_candidates.iter().enumerate() {
                    let mut on_grid = true;
                    for (d, slot) in target.iter_mut().enumerate() {
                        *slot = point[d] + self.problem.controlled_drift(d, time, &point, q) * dt;
                        on_grid &= self.grid.axis(d).contains(*slot);
                    }
                    if self.drop_off_grid && !on_grid {
                        continue;
                    }
                    let value = interp.interpolate_with(&target, &mut stencil)?
                        + self.problem.controlled_flow(time, &point, q) * dt;
                    if value > best {
                        best = value;
                        best_index = k;
                    }
                }
                self.decisions
                    .stochastic_controls
                    .set(node, &self.stochastic_candidates[best_index]);
                best
            } else {
                values[node]
            };

            if !self.explicit_impulse {
                out[node] = continuation;
                continue;
            }

            let mut best = f64::NEG_INFINITY;
            let mut best_index = 0;
            for (k, z) in self.impulse_candidates.iter().enumerate() {
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
                }
            }
            self.decisions
                .impulse_controls
                .set(node, &self.impulse_candidates[best_index]);

            let (value, intervene) = combine(continuation, best);
            out[node] = value;
            self.decisions.intervention[node] = intervene;
        }
        Ok(out)
    }
}
