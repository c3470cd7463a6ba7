pub mod config;
pub mod error;
pub mod lattice;
pub mod montecarlo;
pub mod optimizer;
pub mod scan;
pub mod simulator;
// cmd and reports belong to the binary (src/main.rs).
