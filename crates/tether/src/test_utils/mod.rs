//! Test helpers shared by unit tests, integration tests and benchmarks.

pub mod fakes;
pub mod fixture_workspace;
pub mod log_capture;
