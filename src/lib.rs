//! # Capture Sync Library
//!
//! Record a camera stream and a motion-capture telemetry feed side by side.
//!
//! Telemetry arrives as UDP datagrams (a text timestamp, a comma, then packed
//! little-endian `f32` samples). Every valid packet is written to a full-rate
//! log and published into a single-slot mailbox. Every video frame is pushed
//! into a sink with presentation timing, and the latest telemetry packet at
//! that instant is written to a per-frame correlated log.

pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod session;
pub mod shutdown;
pub mod sink;
pub mod telemetry;
pub mod video;
