//! # Telemetry Module
//!
//! Motion-capture telemetry ingest.
//!
//! This module handles:
//! - Parsing timestamped float datagrams
//! - Receiving them over UDP on a dedicated task
//! - Writing the full-rate log (one row per packet)
//! - Handing the latest packet to the video side through a single-slot mailbox

pub mod logger;
pub mod mailbox;
pub mod packet;
pub mod receiver;
pub mod socket;
