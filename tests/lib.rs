//! Shared infrastructure for the weft integration tests.

pub mod fixtures;
