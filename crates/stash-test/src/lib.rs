//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test.
//!
//!  - Tests against a real Redis server use [`redis_addr!`] to get its address. Such tests are
//!    skipped unless `STASH_TEST_REDIS_ADDR` is set. Every test must use its own database number,
//!    since tests run concurrently and flush their database.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `stash_service` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("stash_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns the `host:port` of the Redis server to run tests against.
///
/// This is read from the `STASH_TEST_REDIS_ADDR` environment variable.
pub fn redis_addr_from_env() -> Option<String> {
    std::env::var("STASH_TEST_REDIS_ADDR")
        .ok()
        .filter(|addr| !addr.trim().is_empty())
}

/// Returns the address of the test Redis server, or skips the current test.
#[macro_export]
macro_rules! redis_addr {
    () => {
        match $crate::redis_addr_from_env() {
            Some(addr) => addr,
            None => {
                println!("Skipping due to missing STASH_TEST_REDIS_ADDR");
                return;
            }
        }
    };
}
