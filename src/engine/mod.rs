//! Work dispatch: the audited loop that runs asynchronous work.

pub mod dispatcher;

pub use dispatcher::{AttemptOutcome, DispatchConfig, WorkDispatcher, WorkHandler};
