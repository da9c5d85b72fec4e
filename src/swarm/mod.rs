//! Multi-drone flight: the height rendezvous and the worker coordinator

mod coordinator;
mod synchronizer;

pub use coordinator::SwarmCoordinator;
pub use synchronizer::{height_correction, SwarmSynchronizer};
