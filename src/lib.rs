//! streamql - a log-query compiler and streaming execution engine
//!
//! This crate parses a label-selector query language into an expression
//! tree, compiles it into an ordered list of executable stages, and applies
//! those stages one log line at a time per stream to filter lines, extract
//! and transform labels, and optionally derive numeric samples for metric
//! aggregation.

pub mod metrics;
pub mod pipeline;
pub mod query;
