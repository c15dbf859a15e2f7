//! JSON-RPC 2.0 engine
//!
//! # Components
//!
//! - [`protocol`] - message model and wire encoding
//! - [`method`] - typed handler registration
//! - [`context`] - what a running handler can see and do
//! - [`session`] - per-connection read loop, dispatch and teardown
//! - [`server`] - method registry, session table and listeners

pub mod context;
mod executor;
pub mod method;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::RequestContext;
pub use method::{MethodInfo, NoParams, CANCEL_REQUEST};
pub use protocol::{
    ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError,
};
pub use server::{Server, ServerOptions};
pub use session::Session;
