//! Liveness analysis for the register allocator.
//!
//! - [`linear_order`]: block linearization and loop detection
//! - [`interval`]: live ranges, use positions and splittable intervals
//! - [`analysis`]: live-in/live-out/kill sets and interval construction

pub mod analysis;
pub mod interval;
pub mod linear_order;

pub use analysis::{BlockInfo, SsaLivenessAnalysis, LIFETIME_STRIDE};
pub use interval::{IntervalId, LiveInterval, LiveIntervals, LiveRange, UsePosition};
pub use linear_order::{LinearOrder, LoopInfo};
