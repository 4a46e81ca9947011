//! Convergence studies over successive refinement levels.
//!
//! Each row solves the problem one level finer than the previous row and reports the
//! value at a fixed test point, the change from the previous level and the ratio of
//! successive changes. A ratio near `2^p` indicates order-`p` convergence.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::core::{ConfigError, HjbqviError};
use crate::engines::hjbqvi::problem::Hjbqvi;
use crate::engines::hjbqvi::result::HjbqviResult;

/// One refinement level of a convergence study.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceRow {
    pub refinement: usize,
    pub nodes: usize,
    pub stochastic_control_nodes: usize,
    pub impulse_control_nodes: usize,
    pub timesteps: usize,
    pub scaling_factor: f64,
    pub iteration_tolerance: f64,
    pub mean_inner_iterations: f64,
    pub mean_solver_iterations: f64,
    pub value: f64,
    /// `NaN` on the first row.
    pub change: f64,
    /// Previous change over this change; `NaN` on the first two rows.
    pub ratio: f64,
    pub execution_time_seconds: f64,
}

impl ConvergenceRow {
    fn new(
        refinement: usize,
        result: &HjbqviResult,
        value: f64,
        previous: Option<&ConvergenceRow>,
    ) -> Self {
        let change = previous.map_or(f64::NAN, |p| value - p.value);
        let ratio = previous.map_or(f64::NAN, |p| p.change / change);
        Self {
            refinement,
            nodes: result.nodes(),
            stochastic_control_nodes: result.stochastic_control_grid.size(),
            impulse_control_nodes: result.impulse_control_grid.size(),
            timesteps: result.timesteps,
            scaling_factor: result.scaling_factor,
            iteration_tolerance: result.iteration_tolerance,
            mean_inner_iterations: result.mean_inner_iterations,
            mean_solver_iterations: result.mean_solver_iterations,
            value,
            change,
            ratio,
            execution_time_seconds: result.execution_time_seconds,
        }
    }
}

/// Rows of a study plus the result at the finest level.
#[derive(Debug, Clone)]
pub struct ConvergenceTable {
    pub test_point: Vec<f64>,
    pub rows: Vec<ConvergenceRow>,
    pub finest: HjbqviResult,
}

impl ConvergenceTable {
    /// Rows as a JSON array.
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(&self.rows).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Value at the finest level.
    pub fn value(&self) -> f64 {
        self.rows.last().map_or(f64::NAN, |row| row.value)
    }

    /// Per-node view of the finest solve.
    pub fn nodes(&self) -> NodeTable<'_> {
        NodeTable {
            result: &self.finest,
        }
    }
}

/// Coordinates, value and controls at every node of a solve, one line per node.
///
/// Controls not in force at a node print as `NaN`.
#[derive(Debug, Clone, Copy)]
pub struct NodeTable<'a> {
    result: &'a HjbqviResult,
}

impl fmt::Display for NodeTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = self.result;
        for d in 0..result.spatial_grid.dimension() {
            write!(f, "{:>WIDTH$}", format!("x{d}"))?;
        }
        write!(f, "{:>WIDTH$}", "Value")?;
        for d in 0..result.stochastic_controls.len() {
            write!(f, "{:>WIDTH$}", format!("q{d}"))?;
        }
        for d in 0..result.impulse_controls.len() {
            write!(f, "{:>WIDTH$}", format!("z{d}"))?;
        }
        writeln!(f)?;

        for (i, point) in result.spatial_grid.nodes().iter().enumerate() {
            for x in point {
                write!(f, "{x:>WIDTH$.4}")?;
            }
            write!(f, "{:>WIDTH$.6}", result.solution[i])?;
            for control in result
                .stochastic_controls
                .iter()
                .chain(&result.impulse_controls)
            {
                write!(f, "{:>WIDTH$.4}", control[i])?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

const WIDTH: usize = 12;

impl fmt::Display for ConvergenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers = [
            "Level", "Nodes", "CtrlNodes", "ImpNodes", "Steps", "Scaling", "Tolerance",
            "MeanIters", "MeanSolver", "Value", "Change", "Ratio", "Seconds",
        ];
        for header in headers {
            write!(f, "{header:>WIDTH$}")?;
        }
        writeln!(f)?;
        for row in &self.rows {
            write!(
                f,
                "{:>WIDTH$}{:>WIDTH$}{:>WIDTH$}{:>WIDTH$}{:>WIDTH$}",
                row.refinement,
                row.nodes,
                row.stochastic_control_nodes,
                row.impulse_control_nodes,
                row.timesteps,
            )?;
            write!(
                f,
                "{:>WIDTH$.2e}{:>WIDTH$.2e}{:>WIDTH$.2}{:>WIDTH$.2}",
                row.scaling_factor,
                row.iteration_tolerance,
                row.mean_inner_iterations,
                row.mean_solver_iterations,
            )?;
            writeln!(
                f,
                "{:>WIDTH$.6}{:>WIDTH$.3e}{:>WIDTH$.3}{:>WIDTH$.3}",
                row.value, row.change, row.ratio, row.execution_time_seconds,
            )?;
        }
        Ok(())
    }
}

/// Solves `problem` at every level in `min..=max` and tabulates the value at
/// `test_point`.
///
/// # Errors
/// [`ConfigError::InvalidRefinementRange`] when `min > max`, otherwise the first solve
/// error encountered.
pub fn convergence_table(
    problem: &Hjbqvi,
    test_point: &[f64],
    min: usize,
    max: usize,
) -> Result<ConvergenceTable, HjbqviError> {
    if min > max {
        return Err(ConfigError::InvalidRefinementRange { min, max }.into());
    }
    if test_point.len() != problem.dimension() {
        return Err(ConfigError::PointDimension {
            expected: problem.dimension(),
            actual: test_point.len(),
        }
        .into());
    }

    let levels: Vec<usize> = (min..=max).collect();
    let mut rows: Vec<ConvergenceRow> = Vec::with_capacity(levels.len());
    let mut finest = None;
    for (&level, result) in levels.iter().zip(problem.solve_levels(&levels)) {
        let result = result?;
        let value = result.value_at(test_point);
        let row = ConvergenceRow::new(level, &result, value, rows.last());
        debug!(
            level,
            value,
            change = row.change,
            ratio = row.ratio,
            "refinement level done"
        );
        rows.push(row);
        finest = Some(result);
    }

    let finest = finest.ok_or(ConfigError::InvalidRefinementRange { min, max })?;
    Ok(ConvergenceTable {
        test_point: test_point.to_vec(),
        rows,
        finest,
    })
}
