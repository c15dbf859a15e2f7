//! Registered methods
//!
//! A [`MethodInfo`] pairs a method name with a typed handler. The params
//! type plays the role of the request factory: params are deserialized
//! into it on the read loop, before the handler is scheduled, so a bad
//! payload is answered with a ParseError without spawning anything.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::context::RequestContext;
use super::protocol::{RequestId, ResponseError};

/// Built-in cancellation method
pub const CANCEL_REQUEST: &str = "$/cancelRequest";

/// Handler future after type erasure
pub type HandlerFuture = BoxFuture<'static, Result<Value, ResponseError>>;

/// A handler with its params already decoded, waiting for its context
pub(crate) type BoundCall = Box<dyn FnOnce(RequestContext) -> HandlerFuture + Send>;

type Binder = dyn Fn(Value) -> Result<BoundCall, serde_json::Error> + Send + Sync;

pub(crate) enum MethodKind {
    Handler(Box<Binder>),
    /// `$/cancelRequest`: handled by the session itself, never answered
    CancelRequest,
}

pub struct MethodInfo {
    name: String,
    sensitive: bool,
    kind: MethodKind,
}

impl MethodInfo {
    pub fn new<P, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ResponseError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let binder = move |params: Value| -> Result<BoundCall, serde_json::Error> {
            let params: P = serde_json::from_value(params)?;
            let handler = handler.clone();
            let call: BoundCall = Box::new(move |ctx: RequestContext| {
                async move {
                    let result = (*handler)(ctx, params).await?;
                    serde_json::to_value(result).map_err(|e| {
                        ResponseError::internal(format!("failed to serialize result: {}", e))
                    })
                }
                .boxed()
            });
            Ok(call)
        };

        Self {
            name: name.into(),
            sensitive: false,
            kind: MethodKind::Handler(Box::new(binder)),
        }
    }

    pub(crate) fn cancel_request() -> Self {
        Self {
            name: CANCEL_REQUEST.to_string(),
            sensitive: false,
            kind: MethodKind::CancelRequest,
        }
    }

    /// Never log params or results of this method
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    pub fn is_cancel_request(&self) -> bool {
        matches!(self.kind, MethodKind::CancelRequest)
    }

    /// Decode params and bind them to the handler
    pub(crate) fn bind(&self, params: Value) -> Option<Result<BoundCall, serde_json::Error>> {
        match &self.kind {
            MethodKind::Handler(binder) => Some(binder(params)),
            MethodKind::CancelRequest => None,
        }
    }
}

impl std::fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodInfo")
            .field("name", &self.name)
            .field("sensitive", &self.sensitive)
            .field("cancel_request", &self.is_cancel_request())
            .finish()
    }
}

/// Params type for methods that take none; accepts and ignores anything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoParams;

impl<'de> Deserialize<'de> for NoParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(NoParams)
    }
}

/// `$/cancelRequest` params
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    pub id: Option<RequestId>,
}
