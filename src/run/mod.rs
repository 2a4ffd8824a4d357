//! Run lifecycle.
//!
//! - **state**: the run state machine; owns the `Run` record and publishes
//!   every change as an event
//! - **driver**: walks each document's stage graph and finalizes the run
//! - **manager**: registry of runs with submit, pause, resume, cancel,
//!   delete and subscribe

pub mod driver;
pub mod manager;
pub mod state;

pub use driver::drive;
pub use manager::RunManager;
pub use state::RunHandle;
