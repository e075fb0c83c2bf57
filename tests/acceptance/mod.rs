//! Integration tests for Cadence acceptance testing.

mod common;
mod shutdown_test;
mod timing_test;
