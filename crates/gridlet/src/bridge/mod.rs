//! Wire protocol for peer-to-peer proxy traffic.
//!
//! Two halves:
//! - **protocol**: the tagged message shapes exchanged between nodes
//! - **codec**: JSON payload encode/decode plus the length-delimited framing
//!   used by the link layer

pub mod codec;
pub mod protocol;
