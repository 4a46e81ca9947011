use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use qvi_pde::math::grid::Axis;
use qvi_pde::problems::{american_put, black_scholes_call};
use qvi_pde::{Handling, Hjbqvi, LinearSolverKind};
use std::hint::black_box;

// Performance goals (guideline, measured on target hardware):
// - Black-Scholes call, refinement 2 (100 steps): < 20 ms
// - American put by penalty, refinement 1: < 50 ms

fn bench_black_scholes_levels(c: &mut Criterion) {
    let problem = black_scholes_call(0.04, 0.2, 100.0, 1.0, 25)
        .expect("valid axis")
        .build()
        .expect("valid problem");
    let mut group = c.benchmark_group("black_scholes_call_bdf2");
    group.sample_size(10);

    for level in [0_usize, 1, 2] {
        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, &level| {
            b.iter(|| {
                let result = problem.solve(black_box(level)).expect("solve should succeed");
                black_box(result.value_at(&[100.0]))
            })
        });
    }

    group.finish();
}

fn bench_american_put_handlings(c: &mut Criterion) {
    let mut group = c.benchmark_group("american_put_handling");
    group.sample_size(10);

    for (name, handling) in [
        ("penalty", Handling::PENALTY),
        ("direct_control", Handling::DIRECT_CONTROL),
        ("iterated_optimal_stopping", Handling::ITERATED_OPTIMAL_STOPPING),
    ] {
        let problem = american_put(0.04, 0.2, 100.0, 1.0, 25)
            .expect("valid axis")
            .handling(handling)
            .build()
            .expect("valid problem");
        group.bench_function(name, |b| {
            b.iter(|| {
                let result = problem.solve(1).expect("solve should succeed");
                black_box(result.value_at(&[100.0, 1.0]))
            })
        });
    }

    group.finish();
}

fn bench_linear_solvers(c: &mut Criterion) {
    let mut group = c.benchmark_group("controlled_diffusion_linear_solver");
    group.sample_size(10);

    for (name, kind) in [
        ("bicgstab", LinearSolverKind::BiCgStab),
        ("lu", LinearSolverKind::Lu),
    ] {
        let problem = Hjbqvi::builder()
            .spatial_axis(Axis::uniform(-1.0, 1.0, 41).expect("valid axis"))
            .stochastic_control_axis(Axis::uniform(-1.0, 1.0, 5).expect("valid axis"))
            .impulse_control_axis(Axis::new(vec![0.0]).expect("valid axis"))
            .expiry(0.5)
            .timesteps(20)
            .discount(|_, _| 0.1)
            .volatility(0, |_, _| 0.3)
            .controlled_drift(0, |_, _, q| q[0])
            .controlled_flow(|_, x, q| -x[0] * x[0] - 0.1 * q[0] * q[0])
            .exit_function(|_, _| 0.0)
            .linear_solver(kind)
            .build()
            .expect("valid problem");
        group.bench_function(name, |b| {
            b.iter(|| black_box(problem.solve(0).expect("solve should succeed").solution))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_black_scholes_levels,
    bench_american_put_handlings,
    bench_linear_solvers
);
criterion_main!(benches);
