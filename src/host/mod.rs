//! Host-facing surface: wire contract, message routing and the stdio bridge.

pub mod contract;
pub mod router;
pub mod stdio;
