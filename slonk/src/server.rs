//! Metrics HTTP endpoint
//!
//! Serves Prometheus text on `GET /metrics`, appending whatever jobs pushed
//! through `POST /write` since the previous scrape.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use slonk_core::metrics::MetricsBuffer;

const MAX_REQUEST_BYTES: usize = 1 << 20;

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    fn to_http(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.body.len(),
            self.body
        )
    }
}

/// Answer one request
pub fn route(method: &str, path: &str, body: &[u8], buffer: &MetricsBuffer) -> Response {
    match (method, path) {
        ("GET", "/metrics") => {
            let mut output = prometheus::TextEncoder::new()
                .encode_to_string(&prometheus::gather())
                .unwrap_or_default();
            output.push_str(&buffer.drain());
            Response::new(200, output)
        }
        ("POST", "/write") => {
            let records: Vec<serde_json::Map<String, Value>> = match serde_json::from_slice(body) {
                Ok(records) => records,
                Err(e) => return Response::new(400, format!("invalid metric batch: {}\n", e)),
            };
            match buffer.write(&records) {
                Ok(count) => {
                    debug!(records = count, "Buffered job metrics");
                    Response::new(200, "")
                }
                Err(e) => Response::new(400, format!("{}\n", e)),
            }
        }
        ("GET", "/health") => Response::new(200, "ok\n"),
        _ => Response::new(404, "not found\n"),
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

async fn handle(mut socket: TcpStream, buffer: Arc<MetricsBuffer>) -> Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0; 4096];

    let body_start = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            socket
                .write_all(Response::new(413, "").to_http().as_bytes())
                .await?;
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buf[..body_start]).into_owned();
    let wanted = content_length(&head);
    if wanted > MAX_REQUEST_BYTES {
        socket
            .write_all(Response::new(413, "").to_http().as_bytes())
            .await?;
        return Ok(());
    }
    while buf.len() - body_start < wanted {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();
    let end = buf.len().min(body_start + wanted);

    let response = route(method, path, &buf[body_start..end], &buffer);
    if response.status != 200 {
        warn!(method = method, path = path, status = response.status, "Rejected request");
    }
    socket.write_all(response.to_http().as_bytes()).await?;
    Ok(())
}

/// Serve metrics on `port` until shutdown is signalled
pub async fn serve(
    port: u16,
    buffer: Arc<MetricsBuffer>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let buffer = buffer.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle(socket, buffer).await {
                        debug!(peer = %peer, error = %e, "Metrics request failed");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Metrics server stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> MetricsBuffer {
        MetricsBuffer::new("jobmetrics")
    }

    #[test]
    fn test_write_then_scrape_drains() {
        let buffer = buffer();
        let body = br#"[{"__name__": "step/time", "__value__": 1.5, "job": "train"}]"#;

        assert_eq!(route("POST", "/write", body, &buffer).status, 200);

        let scrape = route("GET", "/metrics", b"", &buffer);
        assert_eq!(scrape.status, 200);
        assert!(scrape
            .body
            .contains("jobmetrics_step_time{job=\"train\"} 1.5\n"));

        let again = route("GET", "/metrics", b"", &buffer);
        assert!(!again.body.contains("jobmetrics_step_time"));
    }

    #[test]
    fn test_bad_batches_rejected() {
        let buffer = buffer();
        assert_eq!(route("POST", "/write", b"not json", &buffer).status, 400);
        assert_eq!(
            route("POST", "/write", br#"[{"__value__": 1}]"#, &buffer).status,
            400
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_health_and_unknown_paths() {
        let buffer = buffer();
        assert_eq!(route("GET", "/health", b"", &buffer), Response::new(200, "ok\n"));
        assert_eq!(route("GET", "/nope", b"", &buffer).status, 404);
        assert_eq!(route("DELETE", "/metrics", b"", &buffer).status, 404);
    }

    #[test]
    fn test_request_parsing_helpers() {
        let raw = b"POST /write HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\n[]";
        let end = header_end(raw).unwrap();
        assert_eq!(&raw[end..], b"[]");
        let head = String::from_utf8_lossy(&raw[..end]);
        assert_eq!(content_length(&head), 12);
        assert_eq!(content_length("GET / HTTP/1.1\r\n\r\n"), 0);
    }

    #[test]
    fn test_http_rendering() {
        let http = Response::new(200, "ok\n").to_http();
        assert!(http.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(http.contains("Content-Length: 3\r\n"));
        assert!(http.ends_with("\r\n\r\nok\n"));
    }
}
