use color_eyre::eyre::{Result, WrapErr};
use tokio::net::TcpListener;

use ridge_jsonrpc::cli::Cli;
use ridge_jsonrpc::config::{AppConfig, ServerConfig, TransportKind};
use ridge_jsonrpc::rpc::Server;
use ridge_jsonrpc::{lifecycle, logging};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse_args();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let log_guard = logging::init(&config.general.log_level, config.general.log_file.as_deref())?;
    tracing::info!(
        "ridge-jsonrpc {} starting ({} transport)",
        env!("CARGO_PKG_VERSION"),
        config.server.transport
    );

    let server = Server::new(config.server.options());
    lifecycle::register(&server);

    let serving = serve(server.clone(), config.server.clone());

    let result: Result<()> = tokio::select! {
        result = serving => result,
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("Failed to listen for Ctrl-C")?;
            tracing::info!("interrupted");
            Ok(())
        }
    };

    server.shutdown().await;
    tracing::info!("ridge-jsonrpc stopped");
    result?;

    if config.server.transport.reads_blocking_stdin() {
        // Dropping the runtime would wait on the stdin reader thread
        drop(log_guard);
        std::process::exit(0);
    }
    Ok(())
}

async fn serve(server: Server, config: ServerConfig) -> Result<()> {
    match config.transport {
        TransportKind::Stdio => {
            server.serve_stdio().await;
            Ok(())
        }
        TransportKind::Tcp => {
            let listener = bind(&config.listen).await?;
            server.listen_tcp(listener).await?;
            Ok(())
        }
        TransportKind::WebSocket => {
            let listener = bind(&config.listen).await?;
            server.listen_websocket(listener).await?;
            Ok(())
        }
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", addr))
}
