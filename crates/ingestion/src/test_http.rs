use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct CapturedHttpRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
}

pub(crate) struct ScriptedResponse {
    status: u16,
    body: String,
    headers: Vec<(&'static str, String)>,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn raw(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    }
}

/// Serves one connection per scripted response, in order, then exits.
/// Returns the `/v2/actions` URL and a handle yielding the captured requests.
pub(crate) fn spawn_scripted_server(
    responses: Vec<ScriptedResponse>,
) -> io::Result<(String, thread::JoinHandle<Vec<CapturedHttpRequest>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handle = thread::spawn(move || {
        let mut captured = Vec::with_capacity(responses.len());
        for response in responses {
            let (mut stream, _) = listener.accept().expect("accept client");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("set read timeout");
            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 1024];
            let mut header_end = None;
            while header_end.is_none() {
                let read = stream.read(&mut chunk).expect("read request headers");
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
                header_end = find_header_end(&buffer).map(|offset| offset + 4);
            }
            let header_end = header_end.expect("request headers must be present");
            let header_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
            let mut lines = header_text.split("\r\n");
            let request_line = lines.next().unwrap_or_default().to_string();
            let path = request_line
                .split_whitespace()
                .nth(1)
                .unwrap_or_default()
                .to_string();
            let mut headers = HashMap::new();
            for line in lines {
                if let Some((name, value)) = line.split_once(':') {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }

            let extra_headers: String = response
                .headers
                .iter()
                .map(|(name, value)| format!("{name}: {value}\r\n"))
                .collect();
            let reply = format!(
                "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n{}connection: close\r\n\r\n{}",
                response.status,
                reason_phrase(response.status),
                response.body.len(),
                extra_headers,
                response.body
            );
            stream
                .write_all(reply.as_bytes())
                .expect("write response");
            stream.flush().expect("flush response");
            captured.push(CapturedHttpRequest { path, headers });
        }
        captured
    });
    Ok((format!("http://{addr}/v2/actions"), handle))
}

/// A loopback URL nobody listens on.
pub(crate) fn unused_local_url() -> String {
    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(9);
    format!("http://127.0.0.1:{port}/v2/actions")
}
