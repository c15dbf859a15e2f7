//! Minimal LSP lifecycle for the bundled binary
//!
//! `initialize` advertises no capabilities, `shutdown` stops the session
//! from taking new work and `exit` closes it.

use serde::Serialize;
use serde_json::Value;

use crate::rpc::{NoParams, RequestContext, ResponseError, Server};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: Value,
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for InitializeResult {
    fn default() -> Self {
        Self {
            capabilities: Value::Object(Default::default()),
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

pub fn register(server: &Server) {
    server.register("initialize", initialize);
    server.register("shutdown", shutdown);
    server.register("exit", exit);
}

async fn initialize(ctx: RequestContext, _params: Value) -> Result<InitializeResult, ResponseError> {
    tracing::info!(session = ctx.session().id(), peer = %ctx.session().peer(), "initialize");
    Ok(InitializeResult::default())
}

async fn shutdown(ctx: RequestContext, _params: NoParams) -> Result<(), ResponseError> {
    ctx.session()
        .begin_shutdown()
        .map_err(|e| ResponseError::invalid_request().with_data(e.to_string()))
}

async fn exit(ctx: RequestContext, _params: NoParams) -> Result<(), ResponseError> {
    let session = ctx.session();
    if !session.is_shutting_down() {
        tracing::warn!(
            session = session.id(),
            "exit received without a prior shutdown request"
        );
    }
    session.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::rpc::test_support::{wait_until, TestClient};
    use crate::rpc::{ErrorCode, RequestId, Response, ServerOptions};

    fn lifecycle_server() -> Server {
        let server = Server::new(ServerOptions::default());
        register(&server);
        server.register("echo", |_ctx, params: Value| async move {
            Ok::<_, ResponseError>(params)
        });
        server
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let server = lifecycle_server();
        let mut client = TestClient::connect(&server);

        client
            .request(1, "initialize", json!({"processId": null, "capabilities": {}}))
            .await;

        assert_eq!(
            client.read_response().await,
            Response::success(
                RequestId::Number(1),
                json!({
                    "capabilities": {},
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })
            )
        );
    }

    #[tokio::test]
    async fn test_shutdown_then_exit() {
        let server = lifecycle_server();
        let mut client = TestClient::connect(&server);
        wait_until(|| server.session_count() == 1).await;
        let session = server.sessions().remove(0);

        client.request(1, "shutdown", Value::Null).await;
        assert_eq!(
            client.read_response().await,
            Response::success(RequestId::Number(1), Value::Null)
        );
        assert!(session.is_shutting_down());

        client.request(2, "echo", json!("late")).await;
        let error = client.read_response().await.into_result().unwrap_err();
        assert_eq!(error.known_code(), Some(ErrorCode::InvalidRequest));

        client.notify("exit", Value::Null).await;
        client.assert_closed().await;
        assert!(session.is_closed());
        wait_until(|| server.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_exit_without_shutdown_still_closes() {
        let server = lifecycle_server();
        let mut client = TestClient::connect(&server);

        client.notify("exit", Value::Null).await;
        client.assert_closed().await;
        wait_until(|| server.session_count() == 0).await;
    }
}
