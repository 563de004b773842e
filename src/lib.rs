//! Shadow Compare Library
//!
//! Dual-path comparison harness for migrating between two implementations
//! of the same operation, plus the operator HTTP API used by `shadowd`.

pub mod api;
pub mod shadow;
