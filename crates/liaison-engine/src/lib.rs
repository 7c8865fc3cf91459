//! Session lifecycle engine: state machine, polling workers, outbound
//! dispatch and the manager that ties them together.

pub mod dispatch;
pub mod error;
pub mod manager;
pub mod state;
pub mod worker;

pub use dispatch::{DispatchRouter, DispatchStats, Dispatcher};
pub use error::RelayError;
pub use manager::{Collaborators, ManagerConfig, RecoveryReport, RouteOutcome, SessionManager};
pub use worker::{PollingWorker, SessionHandle, WorkerExit};
