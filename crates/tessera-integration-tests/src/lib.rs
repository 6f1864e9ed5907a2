//! Integration test crate for Tessera.
//!
//! This crate has no library code. It only contains tests that drive the
//! key lifecycle, ratchet sessions and the sealed ledger together, on the
//! in-memory and SQLite stores.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p tessera-integration-tests
//! ```
