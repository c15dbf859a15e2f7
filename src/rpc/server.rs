//! Method registry and session table
//!
//! A [`Server`] is cheap to clone and shared by every accepted connection.
//! Registration is usually finished before serving starts, but the table is
//! behind a lock so late registration is also safe.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;

use super::context::RequestContext;
use super::method::{MethodInfo, CANCEL_REQUEST};
use super::protocol::ResponseError;
use super::session::Session;
use crate::error::{Result, RpcError};
use crate::transport::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::Connection;

/// Default cap on handlers executing at once per session
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;

/// Params longer than this are cut short in debug logs
pub const DEFAULT_MAX_LOGGED_BYTES: usize = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// `None` lets every dispatched request run at once
    pub max_concurrent_requests: Option<usize>,
    pub max_frame_size: usize,
    pub max_logged_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_requests: Some(DEFAULT_MAX_CONCURRENT_REQUESTS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_logged_bytes: DEFAULT_MAX_LOGGED_BYTES,
        }
    }
}

pub(crate) struct ServerInner {
    methods: RwLock<HashMap<String, Arc<MethodInfo>>>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
    options: ServerOptions,
}

impl ServerInner {
    pub(crate) fn method(&self, name: &str) -> Option<Arc<MethodInfo>> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn remove_session(&self, id: u64) {
        if self.sessions().remove(&id).is_some() {
            tracing::debug!(session = id, "session removed");
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let mut methods = HashMap::new();
        methods.insert(
            CANCEL_REQUEST.to_string(),
            Arc::new(MethodInfo::cancel_request()),
        );
        Self {
            inner: Arc::new(ServerInner {
                methods: RwLock::new(methods),
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                options,
            }),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Register a typed handler under `name`
    pub fn register<P, R, F, Fut>(&self, name: &str, handler: F) -> bool
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ResponseError>> + Send + 'static,
    {
        self.register_method(MethodInfo::new(name, handler))
    }

    /// Same as [`Server::register`], but params and results never reach the logs
    pub fn register_sensitive<P, R, F, Fut>(&self, name: &str, handler: F) -> bool
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, ResponseError>> + Send + 'static,
    {
        self.register_method(MethodInfo::new(name, handler).sensitive())
    }

    /// Add or replace a method. The built-in `$/cancelRequest` cannot be
    /// replaced; returns `false` if that was attempted.
    pub fn register_method(&self, method: MethodInfo) -> bool {
        if method.name() == CANCEL_REQUEST {
            tracing::warn!("refusing to replace {}", CANCEL_REQUEST);
            return false;
        }
        let name = method.name().to_string();
        let previous = self
            .inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(method));
        if previous.is_some() {
            tracing::debug!("replaced handler for {}", name);
        }
        true
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.inner.method(name).is_some()
    }

    /// Start a session on `connection`; its read loop runs on a spawned task
    pub fn serve(&self, connection: Connection) -> Arc<Session> {
        let Connection {
            mut reader,
            writer,
            peer,
        } = connection;
        reader.set_max_frame_size(self.inner.options.max_frame_size);

        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            Arc::downgrade(&self.inner),
            writer,
            peer,
            &self.inner.options,
        );
        self.inner.sessions().insert(id, session.clone());

        tokio::spawn(session.clone().run(reader));
        session
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.sessions().get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.inner.sessions().values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Serve stdin/stdout until the client goes away
    pub async fn serve_stdio(&self) {
        let session = self.serve(Connection::stdio());
        session.closed().await;
    }

    /// Accept raw TCP connections forever, one session each
    pub async fn listen_tcp(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("listening for TCP connections on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::info!("accepted TCP connection from {}", addr);
                    self.serve(Connection::tcp(stream));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            }
        }
    }

    /// Accept WebSocket connections forever. The handshake runs on its own
    /// task so a slow client cannot hold up the listener.
    pub async fn listen_websocket(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "listening for WebSocket connections on {}",
            listener.local_addr()?
        );
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        tracing::info!("accepted WebSocket connection from {}", addr);
                        server.serve(Connection::websocket(ws, addr.to_string()));
                    }
                    Err(e) => {
                        let err = RpcError::Handshake(e.to_string());
                        tracing::warn!("{} ({})", err, addr);
                    }
                }
            });
        }
    }

    /// Close every open session and wait for their teardown
    pub async fn shutdown(&self) {
        let sessions = self.sessions();
        tracing::info!("closing {} session(s)", sessions.len());
        for session in sessions {
            session.close().await;
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.inner.options)
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::rpc::method::NoParams;
    use crate::rpc::protocol::{self, Message, RequestId, Response};
    use crate::rpc::test_support::{wait_until, TestClient};

    fn echo_server() -> Server {
        let server = Server::new(ServerOptions::default());
        server.register("echo", |_ctx, params: Value| async move {
            Ok::<_, ResponseError>(params)
        });
        server
    }

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.max_concurrent_requests, Some(64));
        assert_eq!(options.max_frame_size, 64 * 1024 * 1024);
        assert_eq!(options.max_logged_bytes, 3000);
    }

    #[test]
    fn test_cancel_request_is_builtin_and_protected() {
        let server = Server::new(ServerOptions::default());
        assert!(server.has_method(CANCEL_REQUEST));

        let replaced = server.register(CANCEL_REQUEST, |_ctx, _: NoParams| async move {
            Ok::<_, ResponseError>(())
        });
        assert!(!replaced);
        assert!(server
            .inner
            .method(CANCEL_REQUEST)
            .unwrap()
            .is_cancel_request());
    }

    #[test]
    fn test_register_and_replace() {
        let server = Server::new(ServerOptions::default());
        assert!(!server.has_method("a"));
        assert!(server.register("a", |_ctx, _: NoParams| async move { Ok::<_, ResponseError>(1) }));
        assert!(server.register_sensitive("a", |_ctx, _: NoParams| async move {
            Ok::<_, ResponseError>(2)
        }));
        assert!(server.has_method("a"));
        assert!(server.inner.method("a").unwrap().is_sensitive());
    }

    #[tokio::test]
    async fn test_late_registration_is_visible_to_open_sessions() {
        let server = Server::new(ServerOptions::default());
        let mut client = TestClient::connect(&server);

        client.request(1, "late", Value::Null).await;
        assert!(client.read_response().await.is_error());

        server.register("late", |_ctx, _: NoParams| async move { Ok::<_, ResponseError>("here") });
        client.request(2, "late", Value::Null).await;
        assert_eq!(
            client.read_response().await,
            Response::success(RequestId::Number(2), json!("here"))
        );
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_ids() {
        let server = echo_server();
        let _a = TestClient::connect(&server);
        let _b = TestClient::connect(&server);

        let ids: Vec<_> = server.sessions().iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(server.session(ids[0]).is_some());
        assert!(server.session(999).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let server = echo_server();
        let mut a = TestClient::connect(&server);
        let mut b = TestClient::connect(&server);
        let sessions = server.sessions();

        server.shutdown().await;

        assert_eq!(server.session_count(), 0);
        assert!(sessions.iter().all(|s| s.is_closed()));
        a.assert_closed().await;
        b.assert_closed().await;
    }

    #[tokio::test]
    async fn test_frame_size_limit_is_applied() {
        let server = Server::new(ServerOptions {
            max_frame_size: 16,
            ..ServerOptions::default()
        });
        let mut client = TestClient::connect(&server);

        client.send_raw(br#"{"jsonrpc":"2.0","id":1,"method":"echo"}"#).await;
        let error = client.read_response().await.into_result().unwrap_err();
        assert_eq!(error.known_code(), Some(protocol::ErrorCode::ParseError));
        client.assert_closed().await;
    }

    #[tokio::test]
    async fn test_tcp_listener_serves_framed_clients() {
        let server = echo_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = server.clone();
        tokio::spawn(async move { accept.listen_tcp(listener).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let body = Message::from(protocol::Request::new(1, "echo", json!("tcp")))
            .to_vec()
            .unwrap();
        crate::transport::codec::write_frame(&mut stream, &body).await.unwrap();

        let frame = crate::transport::codec::read_frame(&mut stream, 1024).await.unwrap();
        assert_eq!(
            protocol::decode(&frame).unwrap(),
            Message::Response(Response::success(RequestId::Number(1), json!("tcp")))
        );

        stream.shutdown().await.unwrap();
        wait_until(|| server.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_websocket_listener_serves_text_messages() {
        let server = echo_server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = server.clone();
        tokio::spawn(async move { accept.listen_websocket(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        ws.send(WsMessage::text(r#"{"jsonrpc":"2.0","id":"w","method":"echo","params":[1]}"#))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            reply.into_text().unwrap().as_str(),
            r#"{"jsonrpc":"2.0","id":"w","result":[1]}"#
        );

        ws.close(None).await.unwrap();
        wait_until(|| server.session_count() == 0).await;
    }
}
