//! End to end tests over a real listener: the gateway runs in-process with a
//! real child (`cat` and small `sh` responders) and is driven with reqwest.

use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use streamway_core::{serve_with_listener, Config, ResponseMode};

/// Echoes every stdin line back on stdout.
const ECHO: &str = "cat";

/// Replies to any input line with a fixed result for id 7.
const RESULT_FOR_7: &str =
    r#"while IFS= read -r line; do printf '{"jsonrpc":"2.0","id":7,"result":{"x":1}}\n'; done"#;

/// Emits a notification for every input line.
const TICKER: &str =
    r#"while IFS= read -r line; do printf '{"jsonrpc":"2.0","method":"tick","params":{"n":1}}\n'; done"#;

/// Consumes stdin and never answers.
const SILENT: &str = "cat > /dev/null";

async fn start_gateway(config: Config) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    let _ = tokio::spawn(serve_with_listener(
        config,
        listener,
        std::future::pending(),
    ));
    format!("http://{}", addr)
}

fn session_id(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("Mcp-Session-Id")
        .expect("missing Mcp-Session-Id header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Incremental reader for `text/event-stream` bodies.
struct EventStream {
    inner: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            inner: response.bytes_stream().boxed(),
            buffer: String::new(),
        }
    }

    /// Next complete frame, without its trailing blank line.
    async fn next_frame(&mut self) -> String {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let frame = self.buffer[..pos].to_string();
                self.buffer.drain(..pos + 2);
                return frame;
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.inner.next())
                .await
                .expect("timed out waiting for an SSE frame")
                .expect("SSE stream ended early")
                .expect("SSE stream failed");
            self.buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    async fn expect_silence(&mut self, wait: Duration) {
        let got = tokio::time::timeout(wait, self.inner.next()).await;
        assert!(got.is_err(), "expected no SSE traffic, got {:?}", got);
    }

    async fn expect_end(&mut self) {
        match tokio::time::timeout(Duration::from_secs(5), self.inner.next())
            .await
            .expect("timed out waiting for the stream to end")
        {
            None => {}
            Some(Err(_)) => {}
            Some(Ok(chunk)) => panic!("unexpected trailing SSE data: {:?}", chunk),
        }
    }
}

fn parse_event(frame: &str) -> (Option<u64>, Value) {
    let mut id = None;
    let mut data = None;
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("id: ") {
            id = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = Some(serde_json::from_str(rest).expect("frame data was not JSON"));
        }
    }
    (id, data.expect("frame carried no data line"))
}

#[tokio::test]
async fn test_notification_post_returns_204_with_session_header() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(!session_id(&response).is_empty());
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_reply_round_trip() {
    let base = start_gateway(Config::new(RESULT_FOR_7)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "echo", "params": {"x": 1}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"jsonrpc": "2.0", "result": {"x": 1}, "id": 7})
    );
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_batch_reply_preserves_id_type() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    // The echo child sends the request straight back; any id-bearing line
    // counts as the reply, so the id round-trips verbatim.
    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": "q", "method": "noop"}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], json!("q"));

    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "noop"}))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], json!(7));
}

#[tokio::test]
async fn test_batch_timeout_returns_504() {
    let mut config = Config::new(SILENT);
    config.batch_timeout_ms = 100;
    let base = start_gateway(config).await;
    let client = reqwest::Client::new();

    let started = Instant::now();
    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": "q", "method": "slow"}))
        .send()
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "Request timeout"},
            "id": "q"
        })
    );
}

#[tokio::test]
async fn test_session_is_reused_when_header_is_echoed() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .send()
        .await
        .unwrap();
    let sid = session_id(&first);

    let second = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &sid)
        .json(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(session_id(&second), sid);

    // Unknown session ids are not adopted; the gateway mints a fresh one.
    let third = client
        .post(format!("{}/mcp", base))
        .header("Mcp-Session-Id", "nonesuch")
        .json(&json!({"jsonrpc": "2.0", "method": "ping"}))
        .send()
        .await
        .unwrap();
    let other = session_id(&third);
    assert_ne!(other, "nonesuch");
    assert_ne!(other, sid);
}

#[tokio::test]
async fn test_sse_connect_then_resume_with_last_event_id() {
    let base = start_gateway(Config::new(TICKER)).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/mcp", base)).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let sid = session_id(&response);

    let mut stream = EventStream::new(response);
    let prologue = stream.next_frame().await;
    assert_eq!(
        prologue,
        format!("event: connected\ndata: {{\"sessionId\":\"{}\"}}", sid)
    );

    // Each notification POST makes the child emit one tick.
    for _ in 0..3 {
        let posted = client
            .post(format!("{}/mcp", base))
            .header("Mcp-Session-Id", &sid)
            .json(&json!({"jsonrpc": "2.0", "method": "ping"}))
            .send()
            .await
            .unwrap();
        assert_eq!(posted.status(), reqwest::StatusCode::NO_CONTENT);
    }

    let expected = json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": 1}});
    for want_id in 1..=3u64 {
        let (id, data) = parse_event(&stream.next_frame().await);
        assert_eq!(id, Some(want_id));
        assert_eq!(data, expected);
    }
    drop(stream);

    // Resume from event 1: the last two entries replay with ids 1 and 2.
    let resumed = client
        .get(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &sid)
        .header("Last-Event-ID", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(session_id(&resumed), sid);

    let mut stream = EventStream::new(resumed);
    let prologue = stream.next_frame().await;
    assert!(prologue.starts_with("event: connected\n"));
    for want_id in 1..=2u64 {
        let (id, data) = parse_event(&stream.next_frame().await);
        assert_eq!(id, Some(want_id));
        assert_eq!(data, expected);
    }
}

#[tokio::test]
async fn test_delete_unknown_session_returns_404() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let response = client
        .delete(format!("{}/mcp", base))
        .header("Mcp-Session-Id", "nonesuch")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "Session nonesuch not found"},
            "id": null
        })
    );
}

#[tokio::test]
async fn test_delete_requires_session_header() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let response = client.delete(format!("{}/mcp", base)).send().await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], json!("Missing session ID"));
    assert_eq!(body["id"], json!(null));
}

#[tokio::test]
async fn test_delete_ends_streams_and_forgets_the_session() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{}/mcp", base)).send().await.unwrap();
    let sid = session_id(&response);
    let mut stream = EventStream::new(response);
    stream.next_frame().await; // connected

    let deleted = client
        .delete(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

    stream.expect_end().await;

    let again = client
        .delete(format!("{}/mcp", base))
        .header("Mcp-Session-Id", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsupported_method_returns_405() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let response = client.put(format!("{}/mcp", base)).send().await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "Method PUT not allowed"},
            "id": null
        })
    );
}

#[tokio::test]
async fn test_non_object_body_returns_parse_error() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    for body in ["[1,2]", "not json"] {
        let response = client
            .post(format!("{}/mcp", base))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], json!(-32700));
        assert_eq!(body["error"]["message"], json!("Parse error: Invalid JSON"));
    }
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let base = start_gateway(Config::new(ECHO)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/mcp", base))
        .header("content-type", "application/json")
        .body("x".repeat(5 * 1024 * 1024))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_health_endpoint_and_static_headers() {
    let mut config = Config::new(ECHO);
    config.health_endpoints = vec!["/healthz".to_string()];
    config
        .static_headers
        .insert("x-served-by".to_string(), "streamway".to_string());
    let base = start_gateway(config).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(
        health.headers().get("x-served-by").unwrap(),
        "streamway"
    );
    assert_eq!(health.text().await.unwrap(), "ok");

    let options = client
        .request(reqwest::Method::OPTIONS, format!("{}/mcp", base))
        .send()
        .await
        .unwrap();
    assert_eq!(options.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(
        options
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    assert_eq!(
        options
            .headers()
            .get("access-control-allow-credentials")
            .unwrap(),
        "true"
    );
    assert_eq!(options.headers().get("x-served-by").unwrap(), "streamway");
}

#[tokio::test]
async fn test_stream_mode_reply_arrives_as_an_event() {
    let mut config = Config::new(RESULT_FOR_7);
    config.response_mode = ResponseMode::Stream;
    let base = start_gateway(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "echo"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut stream = EventStream::new(response);
    let (id, data) = parse_event(&stream.next_frame().await);
    assert_eq!(id, Some(1));
    assert_eq!(
        data,
        json!({"jsonrpc": "2.0", "result": {"x": 1}, "id": 7})
    );
}

#[tokio::test]
async fn test_stream_mode_timeout_emits_error_event_and_ends() {
    let mut config = Config::new(SILENT);
    config.response_mode = ResponseMode::Stream;
    config.batch_timeout_ms = 100;
    let base = start_gateway(config).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": "q", "method": "slow"}))
        .send()
        .await
        .unwrap();

    let mut stream = EventStream::new(response);
    let (_, data) = parse_event(&stream.next_frame().await);
    assert_eq!(
        data,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32000, "message": "Request timeout"},
            "id": "q"
        })
    );
    stream.expect_end().await;
}

#[tokio::test]
async fn test_replies_stay_inside_their_session() {
    let mut config = Config::new(ECHO);
    config.response_mode = ResponseMode::Stream;
    let base = start_gateway(config).await;
    let client = reqwest::Client::new();

    // Session B just watches its own stream.
    let watcher = client.get(format!("{}/mcp", base)).send().await.unwrap();
    let mut watcher_stream = EventStream::new(watcher);
    watcher_stream.next_frame().await; // connected

    // Session A sends a request; the echoed reply fans out to A only.
    let response = client
        .post(format!("{}/mcp", base))
        .json(&json!({"jsonrpc": "2.0", "id": "a1", "method": "noop"}))
        .send()
        .await
        .unwrap();
    let mut a_stream = EventStream::new(response);
    let (_, data) = parse_event(&a_stream.next_frame().await);
    assert_eq!(data["id"], json!("a1"));

    watcher_stream.expect_silence(Duration::from_millis(300)).await;
}
