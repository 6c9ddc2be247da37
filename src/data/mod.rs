//! Data handling: the hierarchical output sink, frame projection and
//! averaging, and peak fitting.
pub mod fit;
pub mod processor;
pub mod sink;
