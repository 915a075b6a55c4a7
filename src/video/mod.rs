//! # Video Module
//!
//! Video side of the recorder.
//!
//! This module handles:
//! - Frame sources (synthetic generator, length-prefixed reader)
//! - Presentation timing anchored on the first frame
//! - Forwarding frames to the sink and writing the correlated log
//! - The optional per-frame latency probe

pub mod clock;
pub mod feeder;
pub mod frame;
pub mod probe;
pub mod source;
