use clap::Parser;
use std::path::PathBuf;
use streamway_core::{load_config, serve, validate_config, Config, ResponseMode, ServeOutcome};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Expose a stdio MCP server over HTTP with SSE streaming", long_about = None)]
struct Cli {
    /// Shell command that starts the MCP server on stdio
    #[arg(long = "stdio", value_name = "COMMAND")]
    stdio: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP endpoint path
    #[arg(long)]
    endpoint: Option<String>,

    /// Reply strategy for id-bearing requests: batch or stream
    #[arg(long, value_name = "MODE")]
    response_mode: Option<String>,

    /// Reply timeout in milliseconds
    #[arg(long, value_name = "MS")]
    batch_timeout: Option<u64>,

    /// Name of the session id header
    #[arg(long, value_name = "NAME")]
    session_header: Option<String>,

    /// Health check path returning 200 ok (repeatable)
    #[arg(long = "health-endpoint", value_name = "PATH")]
    health_endpoints: Vec<String>,

    /// Value for Access-Control-Allow-Origin
    #[arg(long, value_name = "ORIGIN")]
    cors_origin: Option<String>,

    /// Extra response header as "Name: value" (repeatable)
    #[arg(long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    #[arg(short, long)]
    debug: bool,
}

fn parse_header(raw: &str) -> Option<(String, String)> {
    let (name, value) = raw.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {:#}", e);
                std::process::exit(1);
            }
        },
        None => {
            let Some(command) = cli.stdio.clone() else {
                eprintln!("error: --stdio <COMMAND> is required when no config file is given");
                std::process::exit(2);
            };
            Config::new(command)
        }
    };

    // CLI flags override the config file.
    if let Some(command) = cli.stdio {
        config.command = command;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(mode) = cli.response_mode {
        match mode.parse::<ResponseMode>() {
            Ok(mode) => config.response_mode = mode,
            Err(e) => {
                eprintln!("error: {:#}", e);
                std::process::exit(2);
            }
        }
    }
    if let Some(timeout) = cli.batch_timeout {
        config.batch_timeout_ms = timeout;
    }
    if let Some(header) = cli.session_header {
        config.session_header = header;
    }
    if !cli.health_endpoints.is_empty() {
        config.health_endpoints = cli.health_endpoints;
    }
    if let Some(origin) = cli.cors_origin {
        config.cors_origin = origin;
    }
    for raw in &cli.headers {
        match parse_header(raw) {
            Some((name, value)) => {
                config.static_headers.insert(name, value);
            }
            None => {
                eprintln!("error: invalid --header value {:?}, expected \"Name: value\"", raw);
                std::process::exit(2);
            }
        }
    }
    if cli.debug {
        config.debug = true;
    }

    let filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.debug {
        debug!("Config: {:?}", config);
    }

    if let Err(e) = validate_config(&config) {
        error!("Invalid configuration: {:#}", e);
        std::process::exit(1);
    }

    info!("Starting gateway for command: {}", config.command);

    match serve(config, shutdown_signal()).await {
        Ok(ServeOutcome::Shutdown) => {}
        Ok(ServeOutcome::ChildExited(code)) => std::process::exit(code),
        Err(e) => {
            error!("Server error: {:#}", e);
            std::process::exit(1);
        }
    }
}
