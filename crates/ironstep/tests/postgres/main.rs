//! PostgreSQL integration tests.
//!
//! Each test runs against a fresh database; set `TEST_ADMIN_DATABASE_URL` to
//! run them.

mod data_source;
