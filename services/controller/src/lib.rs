//! Cadence controller library.
//!
//! This crate primarily ships a `cadence-controller` binary, but we expose a
//! small library surface to enable integration testing.

pub mod config;
pub mod manifest;
pub mod worker;
