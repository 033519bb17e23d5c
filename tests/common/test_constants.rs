//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Project identifier used for scoped cloud CLI queries in tests.
pub const TEST_PROJECT_ID: &str = "proj-test";

/// Network scope the test fixtures attach instances and gateways to.
pub const TEST_NETWORK: &str = "net-a";

/// Principal reported by fresh test credentials.
pub const TEST_PRINCIPAL: &str = "dev@example.org";
