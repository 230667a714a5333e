//! Fuzzing harnesses for the ethmux multiplexer components.
//!
//! These fuzzers operate on in-memory replicas of the ring, pool, and
//! filter-aggregation algorithms, without touching real shared memory, to
//! test their invariants under arbitrary operation sequences.

pub mod filter_model;
pub mod pool_model;
pub mod ring_model;
