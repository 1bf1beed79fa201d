//! Preparation of per-variable, time-indexed gridded geophysical datasets
//! for downstream machine-learning consumption.
//!
//! This crate re-exports the functionality of `gridprep-core`; see
//! [`processor::ChannelProcessor`] for the main entry point.

pub use gridprep_core::*;
