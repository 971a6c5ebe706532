//! One-shot execution of commands and stored scripts.
//!
//! Components:
//! - `dispatcher`: validates a request, resolves its target and secrets, runs
//!   it and records the outcome.
//! - `local_runner`: runs on the service host, elevating through sudo.
//! - `process`: child process supervision with timeout and output bounds.
//! - `stream`: typed events for the streaming variant.
//! - `types`: requests and results.

pub mod dispatcher;
pub mod local_runner;
pub mod process;
pub mod stream;
pub mod types;


pub use dispatcher::ExecutionDispatcher;
pub use local_runner::LocalRunner;
pub use process::ExecLimits;
pub use stream::{ExecutionEvent, ExecutionStream, OutputSink};
pub use types::{ExecutionPayload, ExecutionRequest, ExecutionResult, ExecutionTarget};
