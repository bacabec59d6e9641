//! Command-line entry points.

pub mod convert;
