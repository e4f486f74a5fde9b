//! Dispatch loop, request task and subject command parsing.

pub mod command;
pub mod dispatcher;
pub mod request;

pub use command::parse_command;
pub use dispatcher::{BatchUserChangeHandler, DispatchHandle, Dispatcher};
pub use request::RequestOutcome;
