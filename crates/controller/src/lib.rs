//! kwork controller: level-triggered reconciliation over a cached object collection.
//!
//! ```text
//! watch stream -> Informer -> Cache (write) -> WorkQueue (key)
//!                                  worker -> Cache (read) -> SyncHandler -> RetryPolicy
//! ```
//!
//! Handlers receive keys, never raw events, so any number of notifications for one key
//! collapse into a sync against the latest cached state.

#![forbid(unsafe_code)]

mod config;
mod controller;
mod error;
mod handler;
mod retry;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{ControllerError, SyncError};
pub use handler::{handler_fn, FnHandler, PrintHandler, SyncHandler};
pub use retry::{ErrorSink, RetryPolicy, TracingSink, Verdict};

pub mod prelude {
    pub use super::{handler_fn, Controller, ControllerConfig, ControllerError, ErrorSink, SyncError, SyncHandler};
    pub use kwork_core::prelude::*;
}
