use qvi_pde::math::grid::Axis;
use qvi_pde::problems::{american_put, black_scholes_call};
use qvi_pde::{
    ConfigError, ControlScheme, Handling, HjbqviError, ImpulseScheme, IterationStage,
    SolverConfig, TimeScheme,
};

#[test]
fn json_config_drives_the_builder() {
    let config = SolverConfig::from_json(
        r#"{
            "handling": { "control": "direct_control", "impulse": "implicit" },
            "scaling_factor": 0.001,
            "max_inner_iterations": 50
        }"#,
    )
    .expect("valid json");

    let problem = american_put(0.05, 0.2, 100.0, 1.0, 10)
        .expect("valid axis")
        .config(config.clone())
        .build()
        .expect("valid problem");
    assert_eq!(problem.config(), &config);
    assert_eq!(problem.handling(), Handling::DIRECT_CONTROL);

    let result = problem.solve(0).expect("solve");
    // Reported scaling is scaling_factor * dt.
    assert!((result.scaling_factor - 0.001 * 0.1).abs() < 1e-15);
}

#[test]
fn malformed_json_is_a_parse_error() {
    let err = SolverConfig::from_json("{ \"scaling_factor\": \"big\" }").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = SolverConfig::from_json("{ \"iteration_tolerance\": -1.0 }").unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidTolerance {
            name: "iteration_tolerance",
            ..
        }
    ));
}

#[test]
fn unsupported_combinations_fail_before_solving() {
    let call = || black_scholes_call(0.04, 0.2, 100.0, 1.0, 10).expect("valid axis");

    let err = call().expiry(0.0).build().unwrap_err();
    assert!(matches!(err, ConfigError::NonPositiveExpiry(_)));

    let err = call().timesteps(0).build().unwrap_err();
    assert_eq!(err, ConfigError::NonPositiveTimesteps);

    let err = call()
        .expiry(f64::INFINITY)
        .handling(Handling::SEMI_LAGRANGIAN)
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::InfiniteHorizonRequiresImplicit);

    let err = call()
        .handling(Handling::new(ControlScheme::Penalty, ImpulseScheme::Explicit))
        .target_timestep_relative_error(0.1)
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::AdaptiveTimesteppingUnsupported);

    let err = call()
        .handling(Handling::ITERATED_OPTIMAL_STOPPING)
        .time_scheme(TimeScheme::Bdf2)
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::IteratedOptimalStoppingUnsupported(_)
    ));

    let err = call().volatility(3, |_, _| 0.2).build().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::DimensionOutOfRange { index: 3, .. }
    ));
}

#[test]
fn malformed_axes_are_rejected() {
    assert!(Axis::new(vec![0.0, 1.0, 1.0]).is_err());
    assert!(Axis::new(Vec::<f64>::new()).is_err());
    assert!(Axis::new(vec![0.0, f64::NAN]).is_err());
    assert!(Axis::uniform(1.0, 0.0, 3).is_err());
}

#[test]
fn iteration_cap_surfaces_as_convergence_failure() {
    let problem = american_put(0.05, 0.2, 100.0, 1.0, 10)
        .expect("valid axis")
        .max_inner_iterations(1)
        .build()
        .expect("valid problem");
    let err = problem.solve(0).unwrap_err();
    match err {
        HjbqviError::ConvergenceFailure {
            stage,
            timestep,
            iterations,
            error,
        } => {
            assert_eq!(stage, IterationStage::Inner);
            assert_eq!(timestep, 0);
            assert_eq!(iterations, 1);
            assert!(error > 0.0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn non_finite_transition_is_reported_not_panicked() {
    let problem = american_put(0.05, 0.2, 100.0, 1.0, 10)
        .expect("valid axis")
        .transition(1, |_, _, _| f64::NAN)
        .build()
        .expect("valid problem");
    match problem.solve(0).unwrap_err() {
        HjbqviError::NonFiniteState { timestep, .. } => assert_eq!(timestep, 0),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn adaptive_step_cap_surfaces_as_convergence_failure() {
    let problem = black_scholes_call(0.04, 0.2, 100.0, 1.0, 25)
        .expect("valid axis")
        .target_timestep_relative_error(1e-6)
        .max_timesteps(2)
        .build()
        .expect("valid problem");
    match problem.solve(0).unwrap_err() {
        HjbqviError::ConvergenceFailure {
            stage,
            timestep,
            iterations,
            error,
        } => {
            assert_eq!(stage, IterationStage::Timestep);
            assert_eq!(timestep, 2);
            assert_eq!(iterations, 2);
            assert!(error > 0.5 && error < 1.0, "time left {error}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn overflowing_refinement_is_a_config_error() {
    let problem = black_scholes_call(0.04, 0.2, 100.0, 1.0, 25)
        .expect("valid axis")
        .build()
        .expect("valid problem");
    for refinement in [64, usize::MAX] {
        assert!(matches!(
            problem.solve(refinement),
            Err(HjbqviError::Config(ConfigError::RefinementTooLarge(r))) if r == refinement
        ));
    }
}
