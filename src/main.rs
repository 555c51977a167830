//! Entry point for the shell-gateway-mcp server.
//!
//! Selects a transport (stdio by default, or SSE / streamable HTTP per the
//! CLI), optionally serves the read-only admin UI alongside it, and
//! initializes tracing to stderr so it never collides with MCP JSON-RPC on
//! stdout.

use anyhow::{Context, Result};
use clap::Parser;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::ServiceExt;
use shell_gateway_mcp::cli::{Cli, Transport};
use shell_gateway_mcp::config::Config;
use shell_gateway_mcp::server::ShellGatewayServer;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let server = ShellGatewayServer::new(config);

    tracing::info!(
        "starting shell-gateway-mcp v{}",
        env!("CARGO_PKG_VERSION")
    );

    if cli.web.web {
        spawn_admin_ui(&server, &cli.web).await?;
    }

    match cli.transport.unwrap_or(Transport::Stdio) {
        Transport::Stdio => run_stdio(server).await,
        Transport::Sse(args) => run_sse(server, &args).await,
        Transport::Http(args) => run_http(server, &args).await,
    }
}

async fn run_stdio(server: ShellGatewayServer) -> Result<()> {
    let service = server.clone().serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {e:?}");
    })?;
    service.waiting().await?;
    server.shutdown().await;
    tracing::info!("shell-gateway-mcp server shut down");
    Ok(())
}

async fn run_sse(server: ShellGatewayServer, args: &shell_gateway_mcp::cli::SseArgs) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid SSE bind address {}:{}", args.host, args.port))?;

    let supervisor_handle = server.supervisor_handle();
    let config = SseServerConfig {
        bind: addr,
        sse_path: "/sse".to_string(),
        post_path: "/message".to_string(),
        ct: CancellationToken::new(),
        sse_keep_alive: None,
    };
    let (sse_server, router) = SseServer::new(config);
    let ct = sse_server.with_service(move || server.clone());

    let router = if let Some(web_path) = &args.web_path {
        router.nest_service(web_path, shell_gateway_mcp::admin::router(supervisor_handle))
    } else {
        router
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind SSE endpoint at {addr}"))?;
    tracing::info!(%addr, "serving MCP over SSE");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .context("SSE server stopped with error")
}

async fn run_http(server: ShellGatewayServer, args: &shell_gateway_mcp::cli::HttpArgs) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid HTTP bind address {}:{}", args.host, args.port))?;

    let supervisor_handle = server.supervisor_handle();
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let mut router = axum::Router::new().nest_service(&args.path, service);
    if let Some(web_path) = &args.web_path {
        router = router.nest_service(web_path, shell_gateway_mcp::admin::router(supervisor_handle));
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP endpoint at {addr}"))?;
    tracing::info!(%addr, path = %args.path, "serving MCP over streamable HTTP");
    axum::serve(listener, router)
        .await
        .context("HTTP server stopped with error")
}

async fn spawn_admin_ui(
    server: &ShellGatewayServer,
    web: &shell_gateway_mcp::cli::WebArgs,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", web.host, web.port)
        .parse()
        .with_context(|| format!("invalid admin UI bind address {}:{}", web.host, web.port))?;
    let router = shell_gateway_mcp::admin::router(server.supervisor_handle());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin UI at {addr}"))?;
    tracing::info!(%addr, prefix = %web.url_prefix, "serving admin UI");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("admin UI server stopped with error: {e:?}");
        }
    });
    Ok(())
}
