//! Smoothed aggregation algebraic multigrid.

pub mod aggregation;
pub mod smoothed_amg;

pub use aggregation::{aggregate, Aggregation};
pub use smoothed_amg::{smoothed_prolongation, AmgConfig, AmgLevel, Cycle, SmoothedAmg};
