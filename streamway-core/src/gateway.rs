//! The HTTP surface and the multiplexing core.
//!
//! One child process serves every client. Inbound requests serialize onto
//! the child's stdin through the supervisor's writer; the child's stdout is
//! a single ordered stream with no addressing, so replies are matched back
//! to clients purely by JSON-RPC id: every framed output line is offered to
//! every session, and whichever session has that id in flight takes it.
//! Lines without an id are notifications and fan out to every session's
//! open SSE streams.
//!
//! A client joins a session by echoing the session id header; everything it
//! may still care about (waiting POSTs, open streams, replayable history)
//! lives in that session, which survives disconnects until an explicit
//! DELETE. The flows per method:
//!
//! - POST with an id either parks the response in the session until the
//!   child replies or the timeout fires (batch mode), or opens an SSE
//!   stream and lets the reply arrive as an event (stream mode).
//! - POST without an id is forwarded and acknowledged with 204.
//! - GET opens an SSE stream, greets it with a `connected` event, and
//!   replays history when the client resumes with `Last-Event-ID`.
//! - DELETE ends every live response of the session and forgets it.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::child::{self, ChildWriter};
use crate::config::{Config, ResponseMode};
use crate::jsonrpc::{
    self, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcResponse, GATEWAY_ERROR, PARSE_ERROR,
};
use crate::session::{Session, SessionRegistry, SlotGuard};
use crate::sse::{self, SseFrame, SseReceiver};

/// Request bodies above this are rejected with 413.
const BODY_LIMIT: usize = 4 * 1024 * 1024;

pub struct AppState {
    config: Config,
    session_header: HeaderName,
    static_headers: Vec<(HeaderName, HeaderValue)>,
    batch_timeout: Duration,
    sessions: Arc<SessionRegistry>,
    child: ChildWriter,
}

impl AppState {
    fn new(config: Config, sessions: Arc<SessionRegistry>, child: ChildWriter) -> Result<Self> {
        let session_header = HeaderName::from_bytes(config.session_header.as_bytes())
            .with_context(|| format!("Invalid session header name: {}", config.session_header))?;

        let mut static_headers = vec![
            (
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_str(&config.cors_origin)
                    .with_context(|| format!("Invalid cors_origin: {}", config.cors_origin))?,
            ),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static(
                    "Content-Type, Accept, Authorization, x-api-key, Last-Event-ID",
                ),
            ),
            (
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_str(&format!(
                    "Content-Type, Authorization, x-api-key, {}",
                    config.session_header
                ))
                .context("Invalid session header name in expose headers")?,
            ),
            (
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            ),
        ];
        for (name, value) in &config.static_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid static header name: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid static header value for {}", name))?;
            static_headers.push((name, value));
        }

        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
        Ok(Self {
            config,
            session_header,
            static_headers,
            batch_timeout,
            sessions,
            child,
        })
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new().route(
        &state.config.endpoint,
        get(handle_get)
            .post(handle_post)
            .delete(handle_delete)
            .options(handle_options)
            .fallback(handle_bad_method),
    );
    for path in &state.config.health_endpoints {
        app = app.route(path, get(handle_health));
    }
    app.layer(middleware::from_fn_with_state(
        state.clone(),
        decorate_response,
    ))
    .layer(DefaultBodyLimit::max(BODY_LIMIT))
    .with_state(state)
}

/// CORS and caller-supplied static headers go on every response.
async fn decorate_response(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in &state.static_headers {
        headers.insert(name.clone(), value.clone());
    }
    response
}

fn set_session_header(state: &AppState, response: &mut Response, session_id: &str) {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(state.session_header.clone(), value);
    }
}

fn rpc_error(status: StatusCode, code: i64, message: impl Into<String>) -> Response {
    (
        status,
        Json(JsonRpcErrorResponse::new(code, message, Value::Null)),
    )
        .into_response()
}

fn empty_ok(state: &AppState, session_id: &str) -> Response {
    let mut response = StatusCode::OK.into_response();
    set_session_header(state, &mut response, session_id);
    response
}

fn json_reply(state: &AppState, session_id: &str, status: StatusCode, body: Value) -> Response {
    let mut response = (status, Json(body)).into_response();
    set_session_header(state, &mut response, session_id);
    response
}

fn child_write_error(state: &AppState, session_id: &str, error: anyhow::Error) -> Response {
    error!("Failed to forward message to child: {:#}", error);
    let mut response = rpc_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        GATEWAY_ERROR,
        "Failed to forward message to child process",
    );
    set_session_header(state, &mut response, session_id);
    response
}

async fn handle_options() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_bad_method(method: Method) -> Response {
    rpc_error(
        StatusCode::METHOD_NOT_ALLOWED,
        GATEWAY_ERROR,
        format!("Method {} not allowed", method),
    )
}

async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let session_id = headers
        .get(&state.session_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let Some(session_id) = session_id else {
        return rpc_error(StatusCode::BAD_REQUEST, GATEWAY_ERROR, "Missing session ID");
    };

    match state.sessions.remove(&session_id) {
        Some(session) => {
            session.end_all();
            info!("Deleted session {}", session_id);
            let mut response = StatusCode::NO_CONTENT.into_response();
            set_session_header(&state, &mut response, &session_id);
            response
        }
        None => rpc_error(
            StatusCode::NOT_FOUND,
            GATEWAY_ERROR,
            format!("Session {} not found", session_id),
        ),
    }
}

async fn handle_get(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let header_value = headers
        .get(&state.session_header)
        .and_then(|v| v.to_str().ok());
    let (session, created) = state.sessions.get_or_create(header_value);
    if created {
        info!("Created session {}", session.id);
    }

    let replay_from = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(from) = replay_from {
        debug!("Resuming session {} from event {}", session.id, from);
    }

    let (stream_key, replay, rx) = session.open_stream(replay_from);
    let mut preamble = Vec::with_capacity(replay.len() + 1);
    preamble.push(sse::connected_frame(&session.id));
    preamble.extend(replay);

    let guard = SlotGuard::new(session.clone(), stream_key, None);
    sse_response(&state, &session.id, preamble, rx, guard)
}

async fn handle_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_value = headers
        .get(&state.session_header)
        .and_then(|v| v.to_str().ok());
    let (session, created) = state.sessions.get_or_create(header_value);
    if created {
        info!("Created session {}", session.id);
    }

    let message = match serde_json::from_slice::<Value>(&body) {
        Ok(value) if value.is_object() => value,
        _ => {
            let mut response = rpc_error(
                StatusCode::BAD_REQUEST,
                PARSE_ERROR,
                "Parse error: Invalid JSON",
            );
            set_session_header(&state, &mut response, &session.id);
            return response;
        }
    };

    match jsonrpc::request_id(&message).cloned() {
        None => post_notification(&state, session, message),
        Some(id) => match state.config.response_mode {
            ResponseMode::Batch => post_batch(&state, session, id, message).await,
            ResponseMode::Stream => post_stream(&state, session, id, message),
        },
    }
}

fn post_notification(state: &AppState, session: Arc<Session>, message: Value) -> Response {
    if let Err(e) = state.child.send(&message) {
        return child_write_error(state, &session.id, e);
    }

    match state.config.response_mode {
        ResponseMode::Batch => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            set_session_header(state, &mut response, &session.id);
            response
        }
        ResponseMode::Stream => {
            // No reply is coming, but the SSE channel still opens so the
            // client keeps a view of the session's stream.
            let (stream_key, _, rx) = session.open_stream(None);
            let guard = SlotGuard::new(session.clone(), stream_key, None);
            sse_response(state, &session.id, Vec::new(), rx, guard)
        }
    }
}

async fn post_batch(state: &AppState, session: Arc<Session>, id: Value, message: Value) -> Response {
    let key = jsonrpc::correlation_key(&id);
    // Register before forwarding so a fast reply cannot beat the slot.
    let mut rx = session.register_batch(key.clone(), message.clone());
    let _guard = SlotGuard::new(session.clone(), key.clone(), Some(key.clone()));

    if let Err(e) = state.child.send(&message) {
        session.remove_request(&key);
        return child_write_error(state, &session.id, e);
    }

    match tokio::time::timeout(state.batch_timeout, &mut rx).await {
        Ok(Ok(body)) => json_reply(state, &session.id, StatusCode::OK, body),
        Ok(Err(_)) => {
            // The slot ended without a reply: the session was deleted out
            // from under this request.
            debug!(
                "Session {} closed while request {} was in flight",
                session.id, key
            );
            empty_ok(state, &session.id)
        }
        Err(_) => {
            if session.remove_request(&key) {
                info!(
                    "Request {} in session {} timed out after {:?}",
                    key, session.id, state.batch_timeout
                );
                let body = JsonRpcErrorResponse::new(GATEWAY_ERROR, "Request timeout", id);
                let mut response =
                    (StatusCode::GATEWAY_TIMEOUT, Json(body)).into_response();
                set_session_header(state, &mut response, &session.id);
                response
            } else {
                // The reply landed between the timer firing and this check.
                match rx.try_recv() {
                    Ok(body) => json_reply(state, &session.id, StatusCode::OK, body),
                    Err(_) => empty_ok(state, &session.id),
                }
            }
        }
    }
}

fn post_stream(state: &AppState, session: Arc<Session>, id: Value, message: Value) -> Response {
    let key = jsonrpc::correlation_key(&id);
    // Register before forwarding so a fast reply cannot beat the slot: the
    // pending entry and the stream slot both exist before the child can
    // possibly answer.
    session.register_pending(key.clone(), message.clone());
    let (stream_key, _, rx) = session.open_stream(None);

    if let Err(e) = state.child.send(&message) {
        session.remove_request(&key);
        session.remove_response(&stream_key);
        return child_write_error(state, &session.id, e);
    }

    let timeout_session = session.clone();
    let timeout_key = key.clone();
    let timeout_stream_key = stream_key.clone();
    let batch_timeout = state.batch_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(batch_timeout).await;
        let error_body =
            serde_json::to_value(JsonRpcErrorResponse::new(GATEWAY_ERROR, "Request timeout", id))
                .unwrap_or(Value::Null);
        if timeout_session.expire_stream_request(&timeout_key, &timeout_stream_key, &error_body) {
            info!(
                "Request {} in session {} timed out after {:?}",
                timeout_key, timeout_session.id, batch_timeout
            );
        }
    });

    let guard = SlotGuard::new(session.clone(), stream_key, Some(key));
    sse_response(state, &session.id, Vec::new(), rx, guard)
}

fn sse_response(
    state: &AppState,
    session_id: &str,
    preamble: Vec<Bytes>,
    mut rx: SseReceiver,
    guard: SlotGuard,
) -> Response {
    let stream = async_stream::stream! {
        // Holds the slot registration exactly as long as the body lives.
        let _guard = guard;
        for frame in preamble {
            yield Ok::<Bytes, Infallible>(frame);
        }
        while let Some(frame) = rx.recv().await {
            match frame {
                SseFrame::Event(bytes) => yield Ok(bytes),
                SseFrame::Close => break,
            }
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap();
    set_session_header(state, &mut response, session_id);
    response
}

/// Route one framed child output line.
///
/// The child's stdout carries no addressing, so a line with an id is offered
/// to every session and lands wherever that id is in flight; ids are opaque
/// strings after stringification. Lines without an id fan out to everyone.
fn dispatch_child_message(sessions: &SessionRegistry, mode: ResponseMode, message: Value) {
    match jsonrpc::request_id(&message) {
        Some(id) => {
            let key = jsonrpc::correlation_key(id);
            let reply = match serde_json::to_value(JsonRpcResponse::from_child(&message)) {
                Ok(value) => value,
                Err(e) => {
                    error!("Failed to build reply envelope: {}", e);
                    return;
                }
            };
            let stream_mode = mode == ResponseMode::Stream;
            for session in sessions.snapshot() {
                session.deliver_reply(&key, &reply, stream_mode);
            }
        }
        None => {
            let note = match serde_json::to_value(JsonRpcNotification::from_child(&message)) {
                Ok(value) => value,
                Err(e) => {
                    error!("Failed to build notification envelope: {}", e);
                    return;
                }
            };
            for session in sessions.snapshot() {
                session.broadcast(&note);
            }
        }
    }
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The shutdown future resolved and the server drained.
    Shutdown,
    /// The child process died; the gateway should exit with this code.
    ChildExited(i32),
}

/// Bind the configured port and run the gateway until shutdown or child
/// exit.
pub async fn serve(
    config: Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<ServeOutcome> {
    let addr = std::net::SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve_with_listener(config, listener, shutdown).await
}

/// Run the gateway on an already bound listener. Lets callers (and tests)
/// pick the port themselves.
pub async fn serve_with_listener(
    config: Config,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<ServeOutcome> {
    crate::config::validate_config(&config)?;

    let sessions = Arc::new(SessionRegistry::new());
    let mode = config.response_mode;
    let dispatch_sessions = sessions.clone();
    let mut child = child::spawn_child(&config.command, move |message| {
        dispatch_child_message(&dispatch_sessions, mode, message);
    })?;

    let state = Arc::new(AppState::new(config, sessions, child.writer())?);
    info!(
        "Listening on {} with endpoint {}",
        listener.local_addr()?,
        state.config.endpoint
    );

    let app = build_router(state);

    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    let std_listener = listener.into_std()?;
    let server_task = tokio::spawn(async move {
        axum_server::from_tcp(std_listener)
            .handle(server_handle)
            .serve(app.into_make_service())
            .await
    });

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("Shutdown signal received, draining connections");
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    let outcome = tokio::select! {
        served = server_task => {
            served.context("Server task failed")?.context("Server error")?;
            ServeOutcome::Shutdown
        }
        code = child.wait() => {
            error!("Child process exited with code {}, shutting down", code);
            handle.shutdown();
            ServeOutcome::ChildExited(code)
        }
    };

    child.shutdown();
    Ok(outcome)
}
