//! Deterministic, pure logic shared by the engine and backends.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod error;
pub mod rate_limit;
pub mod recovery;
pub mod stats;
pub mod stream;
pub mod types;
