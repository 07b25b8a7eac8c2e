//! Shared helpers for ironstep's database tests.

pub mod db;
