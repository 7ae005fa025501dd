use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Behavior knobs for one mock server instance.
#[derive(Clone)]
pub struct MockOptions {
    /// Number of messages the account holds (ids msg-0001..msg-NNNN).
    pub message_count: usize,
    /// 0-based batchGet call index that answers HTTP 500.
    pub fail_batch_call: Option<usize>,
    /// Answer the first N batchGet calls with HTTP 429.
    pub rate_limit_batch_calls: usize,
    /// Answer every request with HTTP 401.
    pub unauthorized: bool,
    /// Answer queries containing "after:" with an empty listing.
    pub empty_for_after_queries: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        MockOptions {
            message_count: 3,
            fail_batch_call: None,
            rate_limit_batch_calls: 0,
            unauthorized: false,
            empty_for_after_queries: false,
        }
    }
}

struct State {
    options: MockOptions,
    list_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

pub struct MockGmailServer {
    port: u16,
    state: Arc<State>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockGmailServer {
    pub fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State {
            options,
            list_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        listener
            .set_nonblocking(true)
            .expect("set_nonblocking on listener");

        let serve_state = state.clone();
        let serve_shutdown = shutdown.clone();
        let handle = thread::spawn(move || {
            Self::serve(listener, serve_state, serve_shutdown);
        });

        MockGmailServer {
            port,
            state,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.state.batch_calls.load(Ordering::SeqCst)
    }

    /// The decoded `q` parameter of every list call, in order.
    pub fn recorded_queries(&self) -> Vec<String> {
        self.state.queries.lock().expect("queries lock").clone()
    }

    fn serve(listener: TcpListener, state: Arc<State>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .expect("set blocking on stream");
                    stream
                        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
                        .ok();
                    Self::handle_connection(stream, &state);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                Err(_) => break,
            }
        }
    }

    fn handle_connection(mut stream: std::net::TcpStream, state: &State) {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).is_err() {
            return;
        }
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).is_err() {
                return;
            }
            if header.trim().is_empty() {
                break;
            }
        }

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 2 {
            return;
        }
        let (status, response_body) = Self::route(parts[0], parts[1], state);

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            response_body.len(),
            response_body
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
    }

    fn route(method: &str, target: &str, state: &State) -> (String, String) {
        let (path, params) = split_query(target);

        if method != "GET" {
            return (
                "405 Method Not Allowed".to_string(),
                json!({"error": "GET only"}).to_string(),
            );
        }

        if state.options.unauthorized {
            return (
                "401 Unauthorized".to_string(),
                json!({"error": {"code": 401, "message": "Invalid Credentials"}}).to_string(),
            );
        }

        if path.ends_with("/messages/batchGet") {
            return Self::handle_batch_get(&params, state);
        }
        if path.ends_with("/messages") {
            return Self::handle_list(&params, state);
        }
        if let Some(id) = path.rsplit('/').next().filter(|_| path.contains("/messages/")) {
            return ("200 OK".to_string(), message_fixture(id).to_string());
        }
        if path.ends_with("/labels") {
            return Self::handle_labels();
        }

        (
            "404 Not Found".to_string(),
            json!({"error": "not found"}).to_string(),
        )
    }

    fn handle_list(params: &[(String, String)], state: &State) -> (String, String) {
        state.list_calls.fetch_add(1, Ordering::SeqCst);

        let query = param(params, "q");
        if let Some(q) = &query {
            state.queries.lock().expect("queries lock").push(q.clone());
        }

        if state.options.empty_for_after_queries
            && query.as_deref().map(|q| q.contains("after:")).unwrap_or(false)
        {
            return (
                "200 OK".to_string(),
                json!({ "resultSizeEstimate": 0 }).to_string(),
            );
        }

        let total = state.options.message_count;
        let max_results: usize = param(params, "maxResults")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let offset: usize = param(params, "pageToken")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let end = (offset + max_results).min(total);
        let refs: Vec<Value> = (offset..end)
            .map(|i| {
                let id = message_id(i);
                json!({ "id": id, "threadId": format!("thread-{}", id) })
            })
            .collect();

        let mut body = json!({
            "messages": refs,
            "resultSizeEstimate": total
        });
        if end < total {
            body["nextPageToken"] = json!(end.to_string());
        }
        ("200 OK".to_string(), body.to_string())
    }

    fn handle_batch_get(params: &[(String, String)], state: &State) -> (String, String) {
        let call_index = state.batch_calls.fetch_add(1, Ordering::SeqCst);
        if call_index < state.options.rate_limit_batch_calls {
            return (
                "429 Too Many Requests".to_string(),
                json!({"error": {"code": 429, "message": "Rate limit exceeded"}}).to_string(),
            );
        }
        if state.options.fail_batch_call == Some(call_index) {
            return (
                "500 Internal Server Error".to_string(),
                json!({"error": {"code": 500, "message": "backend error"}}).to_string(),
            );
        }

        let ids = param(params, "ids").unwrap_or_default();
        let messages: Vec<Value> = ids
            .split(',')
            .filter(|id| !id.is_empty())
            .map(message_fixture)
            .collect();

        (
            "200 OK".to_string(),
            json!({ "messages": messages }).to_string(),
        )
    }

    fn handle_labels() -> (String, String) {
        let body = json!({
            "labels": [
                { "id": "INBOX", "name": "INBOX", "type": "system",
                  "messagesTotal": 42, "messagesUnread": 7 },
                { "id": "Label_1", "name": "receipts", "type": "user" }
            ]
        });
        ("200 OK".to_string(), body.to_string())
    }
}

impl Drop for MockGmailServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

pub fn message_id(index: usize) -> String {
    format!("msg-{:04}", index + 1)
}

fn message_fixture(id: &str) -> Value {
    json!({
        "id": id,
        "threadId": format!("thread-{}", id),
        "labelIds": ["INBOX"],
        "snippet": format!("snippet of {}", id),
        "sizeEstimate": 1024,
        "payload": {
            "partId": "",
            "mimeType": "multipart/alternative",
            "filename": "",
            "headers": [
                { "name": "From", "value": "Sender <sender@example.com>" },
                { "name": "To", "value": "receiver@example.com" },
                { "name": "Subject", "value": format!("Message {}", id) },
                { "name": "Date", "value": "Mon, 01 Jan 2024 12:00:00 +0000" }
            ],
            "body": { "size": 0 },
            "parts": [
                {
                    "partId": "0",
                    "mimeType": "text/plain",
                    "filename": "",
                    "body": { "size": 10, "data": b64url(format!("body of {}", id).as_bytes()) }
                },
                {
                    "partId": "1",
                    "mimeType": "text/html",
                    "filename": "",
                    "body": { "size": 20, "data": b64url(format!("<p>body of {}</p>", id).as_bytes()) }
                }
            ]
        }
    })
}

fn b64url(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn split_query(target: &str) -> (String, Vec<(String, String)>) {
    match target.split_once('?') {
        Some((path, query)) => {
            let params = query
                .split('&')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    Some((percent_decode(key), percent_decode(value)))
                })
                .collect();
            (path.to_string(), params)
        }
        None => (target.to_string(), Vec::new()),
    }
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
