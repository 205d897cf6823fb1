//! Test helpers
//!
//! Shared by unit tests, the integration tests under `tests/` and the CLI
//! tests. Every helper returns a [`TestContext`] owning the temporary
//! directories; keep it alive for the duration of the test.
//!
//! ```rust,no_run
//! use tandem_core::testing::setup_test_master;
//!
//! let (master, _ctx) = setup_test_master(1).unwrap();
//! assert!(master.is_master());
//! ```

mod context;
mod fixtures;

pub use context::TestContext;
pub use fixtures::{
    commit_test_transactions, setup_test_database, setup_test_master, setup_test_slave,
};
