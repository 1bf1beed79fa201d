//! Core functionality for preparing gridded geophysical datasets for
//! machine-learning consumption: split extension, per-variable
//! normalisation, monthly climatologies, and cached linear-trend
//! forecasting, orchestrated by [`processor::ChannelProcessor`].

pub mod cache;
pub mod calendar;
pub mod climatology;
pub mod cube;
pub mod dataset;
pub mod frequency;
pub mod manifest;
pub mod normalise;
pub mod processor;
pub mod trend;

pub mod errors;
