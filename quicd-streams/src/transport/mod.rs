//! Transport parameters consumed by the stream layer.

pub mod parameters;

pub use parameters::{TransportParameters, TransportParametersBuilder};
