//! Integration tests for the session core
//! These run the wired core against mock HTTP servers over real connections

pub mod test_harness;

pub mod refresh_test;
pub mod session_test;
