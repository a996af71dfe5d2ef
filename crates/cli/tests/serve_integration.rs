//! Integration tests for the `larkline serve` HTTP API and live WebSocket.
//!
//! Each test starts the server as a child process on a unique port,
//! talks to it over raw TCP (HTTP) or `reqwest-websocket` (live protocol),
//! and verifies the responses.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest_websocket::{Message as WsMessage, RequestBuilderExt, WebSocket};

/// Atomic port counter to avoid port conflicts between parallel tests.
/// Base port is derived from process ID so separate test binaries don't
/// collide on the same port range.
static NEXT_PORT: AtomicU16 = AtomicU16::new(0);
static PORT_INIT: std::sync::Once = std::sync::Once::new();

fn next_port() -> u16 {
    PORT_INIT.call_once(|| {
        let base = 20000 + (std::process::id() as u16 % 20000);
        NEXT_PORT.store(base, Ordering::SeqCst);
    });
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

const NUMBER_GRAMMAR: &str = "start: NUMBER\n%import common.NUMBER\n%import common.WS\n%ignore WS";

/// Kills the server when the test ends, pass or fail.
struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

/// Helper: start `larkline serve` on the given port with a short debounce.
fn start_server(port: u16) -> Server {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_larkline"));
    cmd.arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .env("LARKLINE_DEBOUNCE_DELAY", "0.05")
        .env("RUST_LOG", "warn");
    // Redirect stdout/stderr to avoid blocking
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd.spawn().expect("failed to start larkline serve");
    // Wait for server to be ready by polling the port
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Server(child)
}

// ──────────────────────────────────────────────
// HTTP helpers
// ──────────────────────────────────────────────

/// Helper: make a simple HTTP GET request and return (status, body).
fn http_get(port: u16, path: &str) -> (u16, String) {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    http_request(port, &request)
}

/// Helper: make a simple HTTP POST request and return (status, body).
fn http_post(port: u16, path: &str, body: &str) -> (u16, String) {
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: localhost:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        port,
        body.len(),
        body
    );
    http_request(port, &request)
}

fn http_request(port: u16, request: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(request.as_bytes()).expect("failed to write");

    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    parse_http_response(&response)
}

/// Parse an HTTP response into (status_code, body).
fn parse_http_response(response: &str) -> (u16, String) {
    let parts: Vec<&str> = response.splitn(2, "\r\n\r\n").collect();
    let headers = parts.first().unwrap_or(&"").to_string();
    let body = parts.get(1).unwrap_or(&"").to_string();

    let status = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let body = if headers.to_lowercase().contains("transfer-encoding: chunked") {
        decode_chunked(&body)
    } else {
        body
    };
    (status, body)
}

/// Decode chunked transfer encoding.
fn decode_chunked(data: &str) -> String {
    let mut result = String::new();
    let mut remaining = data;

    while let Some(line_end) = remaining.find("\r\n") {
        let size = match usize::from_str_radix(remaining[..line_end].trim(), 16) {
            Ok(s) => s,
            Err(_) => break,
        };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > remaining.len() {
            result.push_str(&remaining[chunk_start..]);
            break;
        }
        result.push_str(&remaining[chunk_start..chunk_end]);
        remaining = remaining.get(chunk_end + 2..).unwrap_or("");
    }
    result
}

fn json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|e| panic!("invalid JSON ({}): {}", e, body))
}

// ──────────────────────────────────────────────
// WebSocket helper
// ──────────────────────────────────────────────

/// Live protocol client speaking JSON text frames.
struct WsClient {
    ws: WebSocket,
}

impl WsClient {
    async fn connect(port: u16) -> Self {
        let ws = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{port}/ws/parsing"))
            .upgrade()
            .send()
            .await
            .unwrap()
            .into_websocket()
            .await
            .unwrap();
        WsClient { ws }
    }

    async fn send(&mut self, value: serde_json::Value) {
        self.send_text(&value.to_string()).await;
    }

    async fn send_text(&mut self, text: &str) {
        self.ws.send(WsMessage::Text(text.to_string().into())).await.unwrap();
    }

    /// Next text frame as JSON. Control frames are skipped.
    async fn recv(&mut self) -> serde_json::Value {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("no frame within 10s");
            match next.expect("server closed the socket").unwrap() {
                WsMessage::Text(text) => return json(&text),
                WsMessage::Close { .. } => panic!("server closed the socket"),
                _ => continue,
            }
        }
    }

    /// Skip messages until one of type `kind` arrives.
    async fn recv_type(&mut self, kind: &str) -> serde_json::Value {
        for _ in 0..20 {
            let message = self.recv().await;
            if message["type"] == kind {
                return message;
            }
        }
        panic!("no '{}' message received", kind);
    }
}

fn content_change(kind: &str, session: &str, content: &str) -> serde_json::Value {
    serde_json::json!({"type": kind, "session_id": session, "data": {"content": content}})
}

// ──────────────────────────────────────────────
// HTTP API
// ──────────────────────────────────────────────

#[test]
fn health_reports_status_and_counters() {
    let port = next_port();
    let _server = start_server(port);

    let (status, body) = http_get(port, "/api/health");
    assert_eq!(status, 200);
    let json = json(&body);
    assert_eq!(json["status"], "healthy");
    assert!(json["version"].is_string());
    assert!(json["uptime"].as_f64().is_some());
    assert_eq!(json["total_parses"], 0);
    assert_eq!(json["cache_size"], 0);
}

#[test]
fn version_lists_parsers() {
    let port = next_port();
    let _server = start_server(port);

    let (status, body) = http_get(port, "/api/version");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["parsers"], serde_json::json!(["earley", "lalr"]));
}

#[test]
fn parse_returns_tree_on_success() {
    let port = next_port();
    let _server = start_server(port);

    let request = serde_json::json!({
        "grammar": NUMBER_GRAMMAR,
        "text": "42",
        "settings": {"parser": "lalr"}
    });
    let (status, body) = http_post(port, "/api/parse", &request.to_string());
    assert_eq!(status, 200);
    let json = json(&body);
    assert_eq!(json["status"], "success");
    assert_eq!(json["error"], serde_json::Value::Null);
    assert_eq!(json["tree"]["data"], "start");
    assert_eq!(json["tree"]["children"][0]["terminal"], "NUMBER");
    assert_eq!(json["grammar_hash"].as_str().map(str::len), Some(64));
}

#[test]
fn parse_reports_grammar_errors_in_result() {
    let port = next_port();
    let _server = start_server(port);

    let request = serde_json::json!({"grammar": "start: undefined_rule", "text": "x"});
    let (status, body) = http_post(port, "/api/parse", &request.to_string());
    assert_eq!(status, 200);
    let json = json(&body);
    assert_eq!(json["status"], "invalid_grammar");
    assert_eq!(json["error"]["type"], "grammar_error");
    assert_eq!(json["tree"], serde_json::Value::Null);
}

#[test]
fn parse_reports_syntax_errors_with_location() {
    let port = next_port();
    let _server = start_server(port);

    let request = serde_json::json!({"grammar": NUMBER_GRAMMAR, "text": "4 2"});
    let (status, body) = http_post(port, "/api/parse", &request.to_string());
    assert_eq!(status, 200);
    let json = json(&body);
    assert_eq!(json["status"], "parse_error");
    assert_eq!(json["error"]["line"], 1);
    assert!(json["error"]["context"].as_str().unwrap().contains('^'));
}

#[test]
fn invalid_requests_get_json_errors() {
    let port = next_port();
    let _server = start_server(port);

    let (status, body) = http_post(port, "/api/parse", "{not json");
    assert_eq!(status, 400);
    assert!(json(&body)["error"].is_string());

    let bad_rule = serde_json::json!({"grammar": "start: \"a\"", "text": "a", "settings": {"start_rule": "a b"}});
    let (status, body) = http_post(port, "/api/parse", &bad_rule.to_string());
    assert_eq!(status, 422);
    assert!(json(&body)["error"].as_str().unwrap().contains("start_rule"));

    let bad_parser = serde_json::json!({"grammar": "start: \"a\"", "text": "a", "settings": {"parser": "cyk"}});
    let (status, _) = http_post(port, "/api/parse", &bad_parser.to_string());
    assert_eq!(status, 422);

    let empty = serde_json::json!({"grammar": "", "settings": {}});
    let (status, _) = http_post(port, "/api/validate", &empty.to_string());
    assert_eq!(status, 422);
}

#[test]
fn validate_reports_counts() {
    let port = next_port();
    let _server = start_server(port);

    let request = serde_json::json!({"grammar": NUMBER_GRAMMAR});
    let (status, body) = http_post(port, "/api/validate", &request.to_string());
    assert_eq!(status, 200);
    let json = json(&body);
    assert_eq!(json["is_valid"], true);
    assert!(json["rule_count"].as_u64().unwrap() >= 1);
    assert!(json["terminal_count"].as_u64().unwrap() >= 1);

    let request = serde_json::json!({"grammar": "start: a b"});
    let (_, body) = http_post(port, "/api/validate", &request.to_string());
    let json = self::json(&body);
    assert_eq!(json["is_valid"], false);
    assert_eq!(json["rule_count"], 0);
    assert_eq!(json["errors"][0]["type"], "grammar_error");
}

#[test]
fn stats_and_maintenance_endpoints() {
    let port = next_port();
    let _server = start_server(port);

    let request = serde_json::json!({"grammar": NUMBER_GRAMMAR, "text": "1"});
    http_post(port, "/api/parse", &request.to_string());

    let (status, body) = http_get(port, "/api/stats");
    assert_eq!(status, 200);
    let stats = json(&body);
    assert_eq!(stats["parse_count"], 1);
    assert_eq!(stats["cache_size"], 1);
    assert_eq!(stats["active_parsers"], 1);
    assert!(stats["workers"].as_u64().unwrap() >= 1);
    assert_eq!(stats["busy_workers"], 0);
    assert_eq!(stats["sessions"]["total_sessions"], 0);

    let (status, body) = http_post(port, "/api/clear-cache", "");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["message"], "Cache clear scheduled");

    let (status, body) = http_post(port, "/api/cleanup", "");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["message"], "Parser cleanup scheduled");
}

#[test]
fn unknown_routes_and_sessions_return_404() {
    let port = next_port();
    let _server = start_server(port);

    let (status, body) = http_get(port, "/nope");
    assert_eq!(status, 404);
    assert_eq!(json(&body)["error"], "not found");

    let (status, _) = http_get(port, "/api/sessions/ghost/result");
    assert_eq!(status, 404);
}

// ──────────────────────────────────────────────
// Live protocol
// ──────────────────────────────────────────────

#[tokio::test]
async fn live_edits_produce_debounced_result() {
    let port = next_port();
    let _server = start_server(port);
    let mut ws = WsClient::connect(port).await;

    ws.send(content_change("grammar_change", "live-1", NUMBER_GRAMMAR)).await;
    let info = ws.recv_type("session_info").await;
    assert_eq!(info["session_id"], "live-1");
    assert_eq!(info["data"]["has_grammar"], true);
    assert_eq!(info["data"]["has_text"], false);
    assert_eq!(info["data"]["connection_count"], 1);

    ws.send(content_change("text_change", "live-1", "3.5")).await;
    let result = ws.recv_type("parse_result").await;
    assert_eq!(result["session_id"], "live-1");
    assert_eq!(result["data"]["status"], "success");
    assert!(result["timestamp"].is_string());

    let (status, body) = http_get(port, "/api/sessions/live-1/result");
    assert_eq!(status, 200);
    assert_eq!(json(&body)["status"], "success");
}

#[tokio::test]
async fn live_force_parse_and_bad_frames() {
    let port = next_port();
    let _server = start_server(port);
    let mut ws = WsClient::connect(port).await;

    ws.send_text("{broken").await;
    let error = ws.recv_type("error").await;
    assert_eq!(error["session_id"], "unknown");
    assert_eq!(error["data"]["error"], "Invalid JSON format");

    ws.send(serde_json::json!({"type": "settings_change", "session_id": "live-2", "data": {"parser": "lalr"}})).await;
    let info = ws.recv_type("session_info").await;
    assert_eq!(info["data"]["settings"]["parser"], "lalr");

    ws.send(serde_json::json!({"type": "bogus", "session_id": "live-2", "data": {}})).await;
    let error = ws.recv_type("error").await;
    assert_eq!(error["session_id"], "live-2");
    assert_eq!(error["data"]["error"], "Invalid message format");

    ws.send(content_change("grammar_change", "live-2", NUMBER_GRAMMAR)).await;
    ws.recv_type("session_info").await;
    ws.send(serde_json::json!({"type": "force_parse", "session_id": "live-2", "data": {}})).await;
    // No text yet: nothing to parse, only the session snapshot.
    let info = ws.recv_type("session_info").await;
    assert_eq!(info["data"]["has_result"], false);
}

#[tokio::test]
async fn live_results_reach_every_subscriber() {
    let port = next_port();
    let _server = start_server(port);
    let mut editor = WsClient::connect(port).await;
    let mut viewer = WsClient::connect(port).await;

    viewer.send(serde_json::json!({"type": "force_parse", "session_id": "shared", "data": {}})).await;
    viewer.recv_type("session_info").await;

    editor.send(content_change("grammar_change", "shared", NUMBER_GRAMMAR)).await;
    editor.recv_type("session_info").await;
    editor.send(content_change("text_change", "shared", "7")).await;

    let seen = viewer.recv_type("parse_result").await;
    assert_eq!(seen["data"]["status"], "success");
    let seen = editor.recv_type("parse_result").await;
    assert_eq!(seen["data"]["tree"]["children"][0]["data"], "7");
}
