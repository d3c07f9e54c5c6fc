use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// How a reply to an id-bearing POST travels back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// The POST blocks until the child replies, then returns one JSON body.
    #[default]
    Batch,
    /// The POST opens an SSE stream and the reply arrives as an event.
    Stream,
}

impl FromStr for ResponseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch" => Ok(ResponseMode::Batch),
            "stream" => Ok(ResponseMode::Stream),
            other => bail!("Unknown response mode '{}', expected batch or stream", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shell command that starts the MCP server on stdio.
    pub command: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub response_mode: ResponseMode,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_session_header")]
    pub session_header: String,

    #[serde(default)]
    pub health_endpoints: Vec<String>,

    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,

    #[serde(default)]
    pub static_headers: HashMap<String, String>,

    #[serde(default)]
    pub debug: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_endpoint() -> String {
    "/mcp".to_string()
}

fn default_batch_timeout_ms() -> u64 {
    30_000
}

fn default_session_header() -> String {
    "Mcp-Session-Id".to_string()
}

fn default_cors_origin() -> String {
    "*".to_string()
}

impl Config {
    /// Config with defaults for everything but the child command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            port: default_port(),
            endpoint: default_endpoint(),
            response_mode: ResponseMode::default(),
            batch_timeout_ms: default_batch_timeout_ms(),
            session_header: default_session_header(),
            health_endpoints: Vec::new(),
            cors_origin: default_cors_origin(),
            static_headers: HashMap::new(),
            debug: false,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    debug!("Loading config from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;

    let config: Config = toml::from_str(&content).with_context(|| {
        format!(
            "Failed to parse config {:?}\n\nExpected format:\ncommand = \"npx some-mcp-server\"\nport = 8000\nendpoint = \"/mcp\"\nresponse_mode = \"batch\"\nbatch_timeout_ms = 30000\nhealth_endpoints = [\"/healthz\"]\n\n[static_headers]\nx-served-by = \"streamway\"",
            path
        )
    })?;

    validate_config(&config)?;

    debug!("Loaded config: {:?}", config);
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.command.trim().is_empty() {
        bail!("command must not be empty");
    }
    if !config.endpoint.starts_with('/') {
        bail!("endpoint must start with '/': {}", config.endpoint);
    }
    for path in &config.health_endpoints {
        if !path.starts_with('/') {
            bail!("health endpoint must start with '/': {}", path);
        }
        if path == &config.endpoint {
            bail!("health endpoint {} collides with the main endpoint", path);
        }
    }
    if config.batch_timeout_ms == 0 {
        bail!("batch_timeout_ms must be greater than zero");
    }
    if axum::http::HeaderName::from_bytes(config.session_header.as_bytes()).is_err() {
        bail!("session_header is not a valid header name: {}", config.session_header);
    }
    for name in config.static_headers.keys() {
        if axum::http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            bail!("static header name is invalid: {}", name);
        }
    }
    Ok(())
}
