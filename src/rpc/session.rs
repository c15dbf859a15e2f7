//! Per-connection session
//!
//! A session owns one connection. Its read loop pulls one message at a
//! time, answers protocol errors directly and hands every valid call to a
//! freshly spawned task. All writes (responses, outbound notifications and
//! requests) go through a single write lock so frames never interleave.
//!
//! Request states: received -> dispatched (executor registered, task
//! spawned) -> completed (response written, executor removed) or
//! cancelled (token flipped, response suppressed).

use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::RequestContext;
use super::executor::ExecutorMap;
use super::method::{BoundCall, CancelParams, MethodInfo};
use super::protocol::{
    self, ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError,
};
use super::server::{ServerInner, ServerOptions};
use crate::error::{Result, RpcError};
use crate::transport::{FrameReader, FrameWriter, TransportError};

/// The only method still accepted once a session is shutting down
pub const EXIT_METHOD: &str = "exit";

/// Non-fatal read errors tolerated in a row before giving up on the connection
const MAX_CONSECUTIVE_READ_ERRORS: usize = 16;

/// Upper bound on closing the connection (a WebSocket close handshake
/// waits on the peer)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    id: u64,
    peer: String,
    server: Weak<ServerInner>,
    writer: Mutex<Box<dyn FrameWriter>>,
    executors: ExecutorMap,
    limiter: Option<Arc<Semaphore>>,
    /// Teardown signal; parent of every request token
    shutdown: CancellationToken,
    closed: AtomicBool,
    shutting_down: AtomicBool,
    max_logged_bytes: usize,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        server: Weak<ServerInner>,
        writer: Box<dyn FrameWriter>,
        peer: String,
        options: &ServerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            server,
            writer: Mutex::new(writer),
            executors: ExecutorMap::default(),
            limiter: options
                .max_concurrent_requests
                .map(|permits| Arc::new(Semaphore::new(permits))),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            max_logged_bytes: options.max_logged_bytes,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Description of the remote end ("stdio", socket address)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Number of requests with an id currently executing or queued
    pub fn in_flight(&self) -> usize {
        self.executors.len()
    }

    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.executors.contains(id)
    }

    /// Resolves once the session has been torn down
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Stop accepting new work: every method except `exit` is refused from now on
    pub fn begin_shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyShuttingDown);
        }
        tracing::info!(session = self.id, "session shutting down");
        Ok(())
    }

    /// Send a notification to the client
    pub async fn notify(&self, notification: Notification) -> Result<()> {
        let body = serde_json::to_vec(&notification)?;
        tracing::debug!(
            session = self.id,
            "notification [{}]: {}",
            notification.method,
            self.preview(&body)
        );
        self.write_body(&body).await
    }

    /// Send a request to the client under a fresh id. Responses from the
    /// client are not correlated.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<RequestId> {
        let id = RequestId::String(uuid::Uuid::new_v4().to_string());
        let request = Request::new(id.clone(), method, params);
        let body = serde_json::to_vec(&request)?;
        tracing::debug!(
            session = self.id,
            "request to client [{}] [{}]: {}",
            id,
            method,
            self.preview(&body)
        );
        self.write_body(&body).await?;
        Ok(id)
    }

    /// Tear the session down. Safe to call any number of times from any
    /// task; only the first call does the work and returns `true`.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let cancelled = self.executors.cancel_all();
        self.shutdown.cancel();
        if let Some(server) = self.server.upgrade() {
            server.remove_session(self.id);
        }

        let closing = async { self.writer.lock().await.close().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session = self.id, "close error: {}", e),
            Err(_) => tracing::warn!(session = self.id, "connection did not close in time"),
        }

        tracing::info!(
            session = self.id,
            peer = %self.peer,
            cancelled,
            "session closed"
        );
        true
    }

    /// Read loop. Runs until a fatal read error or teardown.
    pub(crate) async fn run(self: Arc<Self>, mut reader: Box<dyn FrameReader>) {
        tracing::info!(session = self.id, peer = %self.peer, "session started");
        let mut consecutive_errors = 0;

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(body) => {
                    consecutive_errors = 0;
                    self.handle_frame(body).await;
                }
                Err(err) => {
                    if err.is_framing() {
                        let error = ResponseError::parse_error().with_data(err.to_string());
                        self.respond(Response::error(None, error), false).await;
                    }

                    consecutive_errors += 1;
                    if reader.is_fatal(&err) || consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        match err {
                            TransportError::Closed => {
                                tracing::info!(session = self.id, "client disconnected")
                            }
                            err => tracing::warn!(session = self.id, "read error: {}", err),
                        }
                        break;
                    }
                    tracing::warn!(session = self.id, "dropped unreadable message: {}", err);
                }
            }
        }

        self.close().await;
    }

    async fn handle_frame(self: &Arc<Self>, body: Bytes) {
        match protocol::decode(&body) {
            Ok(Message::Request(request)) => {
                self.dispatch(Some(request.id), request.method, request.params)
                    .await
            }
            Ok(Message::Notification(notification)) => {
                self.dispatch(None, notification.method, notification.params)
                    .await
            }
            Ok(Message::Response(response)) => {
                tracing::debug!(
                    session = self.id,
                    "ignoring response from client for id {}",
                    display_id(response.id.as_ref())
                );
            }
            Err(err) => {
                tracing::warn!(
                    session = self.id,
                    "invalid message: {} ({})",
                    err.error,
                    self.preview(&body)
                );
                self.respond(err.into_response(), false).await;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, id: Option<RequestId>, method: String, params: Value) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let info = server.method(&method);
        drop(server);

        let sensitive = info.as_ref().map_or(false, |info| info.is_sensitive());
        self.log_inbound(id.as_ref(), &method, &params, sensitive);

        let Some(info) = info else {
            match id {
                Some(id) => {
                    let response = Response::error(Some(id), ResponseError::method_not_found());
                    self.respond(response, false).await;
                }
                None => tracing::debug!(session = self.id, "no handler for notification {}", method),
            }
            return;
        };

        if info.is_cancel_request() {
            self.cancel_request(params);
            return;
        }

        if self.is_shutting_down() && method != EXIT_METHOD {
            if let Some(id) = id {
                let error = ResponseError::new(
                    ErrorCode::InvalidRequest.code(),
                    "session is shutting down",
                );
                self.respond(Response::error(Some(id), error), false).await;
            }
            return;
        }

        match info.bind(params) {
            Some(Ok(call)) => self.execute(id, info, call),
            Some(Err(e)) => match id {
                Some(id) => {
                    let error = ResponseError::parse_error().with_data(e.to_string());
                    self.respond(Response::error(Some(id), error), info.is_sensitive())
                        .await;
                }
                None => tracing::warn!(
                    session = self.id,
                    "dropping notification {} with invalid params: {}",
                    method,
                    e
                ),
            },
            None => {}
        }
    }

    /// `$/cancelRequest`: never answered, whatever happens
    fn cancel_request(&self, params: Value) {
        let target = match serde_json::from_value::<CancelParams>(params) {
            Ok(CancelParams { id: Some(id) }) => id,
            Ok(CancelParams { id: None }) => return,
            Err(e) => {
                tracing::warn!(session = self.id, "invalid cancel params: {}", e);
                return;
            }
        };

        if self.executors.cancel(&target) {
            tracing::debug!(session = self.id, "cancelled request {}", target);
        } else {
            tracing::trace!(session = self.id, "nothing to cancel for id {}", target);
        }
    }

    fn execute(self: &Arc<Self>, id: Option<RequestId>, info: Arc<MethodInfo>, call: BoundCall) {
        let token = self.shutdown.child_token();
        let generation = id
            .as_ref()
            .map(|id| self.executors.register(id.clone(), token.clone()));
        let ctx = RequestContext::new(self.clone(), id.clone(), info.name(), token.clone());
        let span = tracing::debug_span!(
            "request",
            session = self.id,
            method = %info.name(),
            id = %display_id(id.as_ref())
        );

        let session = self.clone();
        let limiter = self.limiter.clone();
        tokio::spawn(
            async move {
                let _permit = match limiter {
                    Some(limiter) => {
                        let permit = tokio::select! {
                            biased;
                            _ = token.cancelled() => None,
                            permit = limiter.acquire_owned() => permit.ok(),
                        };
                        if permit.is_none() {
                            session.finish(id.as_ref(), generation);
                            tracing::debug!("cancelled before it started");
                            return;
                        }
                        permit
                    }
                    None => None,
                };

                let outcome = AssertUnwindSafe(call(ctx)).catch_unwind().await;
                session.finish(id.as_ref(), generation);

                if token.is_cancelled() {
                    tracing::debug!("cancelled, result discarded");
                    return;
                }

                let result = outcome.unwrap_or_else(|panic| {
                    tracing::error!("handler panicked: {}", panic_message(panic.as_ref()));
                    Err(ResponseError::internal("handler panicked"))
                });

                match id {
                    Some(id) => {
                        let response = match result {
                            Ok(value) => Response::success(id, value),
                            Err(error) => Response::error(Some(id), error),
                        };
                        session.respond(response, info.is_sensitive()).await;
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!("notification handler failed: {}", e);
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    fn finish(&self, id: Option<&RequestId>, generation: Option<u64>) {
        if let (Some(id), Some(generation)) = (id, generation) {
            self.executors.remove(id, generation);
        }
    }

    /// Write a response; failures are only logged since the channel to
    /// report them is the one that failed
    async fn respond(&self, response: Response, sensitive: bool) {
        let id = display_id(response.id.as_ref());
        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(session = self.id, "failed to serialize response [{}]: {}", id, e);
                return;
            }
        };

        if sensitive {
            tracing::debug!(session = self.id, "response [{}]: ...", id);
        } else {
            tracing::debug!(session = self.id, "response [{}]: {}", id, self.preview(&body));
        }

        if let Err(e) = self.write_body(&body).await {
            tracing::error!(session = self.id, "failed to write response [{}]: {}", id, e);
        }
    }

    async fn write_body(&self, body: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::SessionClosed(self.id));
        }
        // Teardown aborts a write stalled on a peer that stopped reading,
        // which also releases the write lock for `close`
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RpcError::SessionClosed(self.id)),
            written = async { self.writer.lock().await.write_frame(body).await } => {
                written?;
                Ok(())
            }
        }
    }

    fn log_inbound(&self, id: Option<&RequestId>, method: &str, params: &Value, sensitive: bool) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        if sensitive {
            tracing::debug!(session = self.id, "request [{}] [{}], content: ...", display_id(id), method);
        } else {
            let content = params.to_string();
            tracing::debug!(
                session = self.id,
                "request [{}] [{}], content: [{}]",
                display_id(id),
                method,
                truncate(&content, self.max_logged_bytes)
            );
        }
    }

    fn preview<'a>(&self, body: &'a [u8]) -> Cow<'a, str> {
        match String::from_utf8_lossy(body) {
            Cow::Borrowed(text) => truncate(text, self.max_logged_bytes),
            Cow::Owned(text) => Cow::Owned(truncate(&text, self.max_logged_bytes).into_owned()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("in_flight", &self.executors.len())
            .field("closed", &self.is_closed())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

fn display_id(id: Option<&RequestId>) -> String {
    id.map_or_else(|| "null".to_string(), RequestId::to_string)
}

/// Cut `text` to at most `max` bytes on a char boundary
fn truncate(text: &str, max: usize) -> Cow<'_, str> {
    if text.len() <= max {
        return Cow::Borrowed(text);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}... ({} bytes)", &text[..end], text.len()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
