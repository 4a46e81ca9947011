//! Solver engines.

pub mod hjbqvi;
