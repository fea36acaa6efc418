#![doc = include_str!("../../../README.md")]
//!

//! This crate re-exports the sweep engine, adapters and storage of
//! `labsweep-core`.

pub use labsweep_core::*;
