//! Worker lifecycle.
//!
//! - `state`: STARTING → RUNNING → DRAINING → STOPPED
//! - `controller`: consume loop, bounded concurrency, graceful drain
//! - `signal`: Ctrl+C / SIGTERM as a shutdown future

pub mod controller;
pub mod signal;
pub mod state;

pub use controller::WorkerController;
pub use signal::shutdown_signal;
pub use state::{ShutdownReason, WorkerState};
