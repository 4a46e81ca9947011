//! Prints convergence tables for the reference problems.
//!
//! Usage: `hjbqvi_convergence [MAX_REFINEMENT] [--json] [--verbose]`. `--verbose` also
//! prints every node of the finest level. Set `RUST_LOG=qvi_pde=debug` for per-level
//! progress.

use std::error::Error;

use qvi_pde::convergence::convergence_table;
use qvi_pde::problems::{american_put, black_scholes_call};

type AppResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const RATE: f64 = 0.04;
const VOLATILITY: f64 = 0.2;
const STRIKE: f64 = 100.0;
const EXPIRY: f64 = 1.0;
const TIMESTEPS: usize = 25;

fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut max_refinement = 4;
    let mut json = false;
    let mut verbose = false;
    for arg in std::env::args().skip(1) {
        if arg == "--json" {
            json = true;
        } else if arg == "--verbose" {
            verbose = true;
        } else {
            max_refinement = arg.parse()?;
        }
    }

    let european = black_scholes_call(RATE, VOLATILITY, STRIKE, EXPIRY, TIMESTEPS)?.build()?;
    let american = american_put(RATE, VOLATILITY, STRIKE, EXPIRY, TIMESTEPS)?.build()?;

    for (name, problem, point) in [
        ("European call (BDF2)", &european, vec![STRIKE]),
        ("American put (penalty)", &american, vec![STRIKE, 1.0]),
    ] {
        let table = convergence_table(problem, &point, 1, max_refinement)?;
        println!("{name}");
        if json {
            println!("{}", table.to_json_pretty()?);
        } else {
            println!("{table}");
        }
        if verbose {
            println!("{}", table.nodes());
        }
    }
    Ok(())
}
