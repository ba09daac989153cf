pub mod config;
pub mod listener;
pub mod logging;
pub mod smtp;
pub mod supervisor;
pub mod worker;

pub use tracing;

/// Control message broadcast from a worker to its listeners and sessions.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
