//! # mirra - Interactive Live Directory Mirroring
//!
//! Register a source directory with one or more targets; each target is
//! first made an exact mirror of the source, then kept in sync through
//! OS filesystem notifications. `restore` reverses the direction and
//! rebuilds a source from a chosen target. Sessions for independent
//! sources run concurrently, and operator commands are accepted while
//! synchronization is in flight.

// Module declarations
pub mod config;
pub mod fsops;
pub mod logging;
pub mod paths;
pub mod registry;
pub mod repl;
pub mod restore;
pub mod scanner;
pub mod types;
pub mod watcher;
pub mod worker;

// Re-export commonly used types
pub use config::Limits;
pub use registry::{SessionInfo, SessionRegistry};
pub use types::{ChangeEvent, MirrorError};
pub use worker::TargetWorker;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
