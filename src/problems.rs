//! Reference problems used by the convergence study, the benches and the tests.
//!
//! Each function returns a populated [`HjbqviBuilder`], so callers can still swap the
//! handling, the time scheme or any other setting before calling `build`.

use crate::engines::hjbqvi::boundary::linear_boundary;
use crate::engines::hjbqvi::config::{Handling, TimeScheme};
use crate::engines::hjbqvi::problem::{Hjbqvi, HjbqviBuilder};
use crate::math::grid::{Axis, GridError};

/// Nonuniform stock axis clustered around a strike of 100, running out to 10,000.
pub fn vanilla_stock_axis() -> Result<Axis, GridError> {
    Axis::new(vec![
        0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 75.0, 80.0, 84.0, 88.0, 92.0, 94.0,
        96.0, 98.0, 100.0, 102.0, 104.0, 106.0, 108.0, 110.0, 114.0, 118.0, 123.0, 130.0,
        140.0, 150.0, 175.0, 225.0, 300.0, 750.0, 2000.0, 10000.0,
    ])
}

/// European call under Black-Scholes, posed as a QVI with a single (inert) control and no
/// admissible interventions.
///
/// Uses BDF2 and the linearity condition at the far boundary.
pub fn black_scholes_call(
    rate: f64,
    volatility: f64,
    strike: f64,
    expiry: f64,
    timesteps: usize,
) -> Result<HjbqviBuilder, GridError> {
    Ok(Hjbqvi::builder()
        .spatial_axis(vanilla_stock_axis()?)
        .stochastic_control_axis(Axis::new(vec![0.0])?)
        .impulse_control_axis(Axis::new(vec![0.0])?)
        .expiry(expiry)
        .timesteps(timesteps)
        .discount(move |_, _| rate)
        .volatility(0, move |_, x| volatility * x[0])
        .controlled_drift(0, move |_, x, _| rate * x[0])
        .right_boundary(0, linear_boundary)
        .exit_function(move |_, x| (x[0] - strike).max(0.0))
        .handling(Handling::PENALTY)
        .time_scheme(TimeScheme::Bdf2))
}

/// American put as a one-shot impulse problem.
///
/// The second dimension flags whether the option is still alive (`1`) or exercised
/// (`0`). Exercising pays the put payoff and jumps to the exercised state, whose value is
/// identically zero.
pub fn american_put(
    rate: f64,
    volatility: f64,
    strike: f64,
    expiry: f64,
    timesteps: usize,
) -> Result<HjbqviBuilder, GridError> {
    let payoff = move |s: f64| (strike - s).max(0.0);
    Ok(Hjbqvi::builder()
        .spatial_axis(vanilla_stock_axis()?)
        .spatial_axis(Axis::new(vec![0.0, 1.0])?)
        .stochastic_control_axis(Axis::new(vec![0.0])?)
        .impulse_control_axis(Axis::new(vec![0.0])?)
        .expiry(expiry)
        .timesteps(timesteps)
        .discount(move |_, _| rate)
        .volatility(0, move |_, x| volatility * x[0])
        .controlled_drift(0, move |_, x, _| rate * x[0])
        .right_boundary(0, linear_boundary)
        .transition(1, |_, _, _| 0.0)
        .impulse_flow(move |_, x, _| {
            if x[1] > 0.5 {
                payoff(x[0])
            } else {
                f64::NEG_INFINITY
            }
        })
        .exit_function(move |_, x| if x[1] > 0.5 { payoff(x[0]) } else { 0.0 })
        .handling(Handling::PENALTY)
        .time_scheme(TimeScheme::BackwardEuler)
        .disable_impulse_control_refinement())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vanilla_axis_is_clustered_at_the_strike() {
        let axis = vanilla_stock_axis().unwrap();
        assert_eq!(axis.len(), 34);
        assert_eq!(axis.first(), 0.0);
        assert_eq!(axis.last(), 10000.0);
        assert!(axis.contains(100.0));
    }

    #[test]
    fn american_put_is_two_dimensional() {
        let problem = american_put(0.05, 0.2, 100.0, 1.0, 10)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(problem.dimension(), 2);
        assert_eq!(problem.impulse_flow(0.0, &[90.0, 1.0], &[0.0]), 10.0);
        assert_eq!(problem.impulse_flow(0.0, &[90.0, 0.0], &[0.0]), f64::NEG_INFINITY);
        assert_eq!(problem.transition(1, 0.0, &[90.0, 1.0], &[0.0]), 0.0);
        assert_eq!(problem.transition(0, 0.0, &[90.0, 1.0], &[0.0]), 90.0);
        assert_eq!(problem.exit_value(1.0, &[90.0, 0.0]), 0.0);
    }
}
