//! Helpers for testing the metric pipeline.
//!
//! In every test, call [`setup`]. This will set up the logger so that all console output is
//! captured by the test runner. All logs emitted with [`telly_log`] will show up for test failures
//! or when run with `--nocapture`.
//!
//! # Example
//!
//! ```
//! telly_test::setup();
//!
//! telly_log::debug!("hello, world!");
//! ```

/// Setup the test environment.
///
///  - Initializes logs: The logger captures logs from all `telly` crates and mutes all other
///    logs.
pub fn setup() {
    // Directive targets match by prefix, so this covers every crate of the workspace.
    telly_log::__init_test("telly");
}
