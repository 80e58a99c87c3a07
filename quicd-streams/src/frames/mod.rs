//! # Stream Frames (RFC 9000 Section 19)
//!
//! Frame types the stream layer emits, with exact encoded-size accounting.

pub mod types;

pub use types::*;
