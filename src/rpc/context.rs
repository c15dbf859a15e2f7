//! Per-request handler context

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::protocol::{Notification, RequestId};
use super::session::Session;
use crate::error::Result;

/// Handed to every handler invocation.
///
/// Cancellation is cooperative: the engine only flips the token, the
/// handler decides where to observe it.
#[derive(Clone)]
pub struct RequestContext {
    session: Arc<Session>,
    id: Option<RequestId>,
    method: Arc<str>,
    token: CancellationToken,
}

impl RequestContext {
    pub(crate) fn new(
        session: Arc<Session>,
        id: Option<RequestId>,
        method: &str,
        token: CancellationToken,
    ) -> Self {
        Self {
            session,
            id,
            method: Arc::from(method),
            token,
        }
    }

    /// Session the request arrived on
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// `None` for notifications
    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the request is cancelled or the session torn down
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Drive `fut` unless the request is cancelled first
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Push a notification to the client through this request's session
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<()> {
        let params = serde_json::to_value(params)?;
        self.session.notify(Notification::new(method, params)).await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("session", &self.session.id())
            .field("id", &self.id)
            .field("method", &self.method)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
