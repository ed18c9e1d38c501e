//! Boot runtime: dependency resolution, service startup and stage supervision

pub mod dependency;
pub mod executor;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod stage;
pub mod watchdog;

pub use dependency::*;
pub use executor::*;
pub use orchestrator::*;
pub use progress::*;
pub use session::*;
pub use stage::*;
pub use watchdog::*;
