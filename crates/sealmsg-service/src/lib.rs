//! sealmsg-service: the engine that ties the store, ledger, access gate
//! and expiry sweeper together, plus the `sealmsg` command-line front end.

pub mod engine;
pub mod sweeper;

pub use engine::{Engine, EngineConfig};
pub use sweeper::{spawn_sweeper, SweeperHandle};
