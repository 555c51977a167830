//! Command-line surface: transport selection and the optional admin UI.
//!
//! The transport mode is chosen once at startup and is opaque to the tool
//! handlers -- they only ever see MCP requests, regardless of whether those
//! arrived over stdio, SSE, or streamable HTTP.

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "shell-gateway-mcp",
    about = "An MCP server that lets LLM agents run allow-listed shell commands",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub transport: Option<Transport>,

    /// Serve the read-only admin UI over the supervisor instead of (or
    /// alongside) an MCP transport.
    #[command(flatten)]
    pub web: WebArgs,
}

#[derive(Subcommand, Debug)]
pub enum Transport {
    /// Serve MCP over stdio. This is also the default with no subcommand.
    Stdio,
    /// Serve MCP over Server-Sent Events.
    Sse(SseArgs),
    /// Serve MCP over streamable HTTP.
    Http(HttpArgs),
}

#[derive(Args, Debug)]
pub struct SseArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long)]
    pub web_path: Option<String>,
}

#[derive(Args, Debug)]
pub struct HttpArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "/mcp")]
    pub path: String,
    #[arg(long)]
    pub web_path: Option<String>,
}

#[derive(Args, Debug)]
pub struct WebArgs {
    /// Serve the read-only admin UI (process list, logs, stop/clean actions).
    #[arg(long)]
    pub web: bool,
    #[arg(long, default_value_t = 8081)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "/")]
    pub url_prefix: String,
}
