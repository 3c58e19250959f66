//! Per-protocol wire formats, discovery cycles, and output adapters.

pub mod ether_dream;
pub mod idn;
