#![forbid(unsafe_code)]

// In-process HTTP/1.1 stub of the chat API, used by provisioning and
// scenario tests. One request per connection, `connection: close` on every
// response. Signups can be made to fail on a fixed cadence to exercise the
// best-effort provisioning path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub(crate) struct StubChatServer {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl StubChatServer {
    /// Every `fail_nth`-th signup answers 500 (0 = never fail).
    pub async fn spawn(fail_nth: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let base_url = format!("http://{}", listener.local_addr().expect("stub addr"));
        let handle = tokio::spawn(serve(listener, fail_nth));
        Self { base_url, handle }
    }
}

impl Drop for StubChatServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(listener: TcpListener, fail_nth: usize) {
    let signups = Arc::new(AtomicUsize::new(0));
    let rooms = Arc::new(AtomicUsize::new(0));
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            break;
        };
        let signups = signups.clone();
        let rooms = rooms.clone();
        tokio::spawn(async move {
            let _ = handle_connection(socket, &signups, &rooms, fail_nth).await;
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    signups: &AtomicUsize,
    rooms: &AtomicUsize,
    fail_nth: usize,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + 4 + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request_line = head.lines().next().unwrap_or_default();
    let (status, body) = route(request_line, signups, rooms, fail_nth);
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn route(
    request_line: &str,
    signups: &AtomicUsize,
    rooms: &AtomicUsize,
    fail_nth: usize,
) -> (&'static str, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    match (method, path) {
        ("POST", "/api/auth/signup") => {
            let n = signups.fetch_add(1, Ordering::SeqCst) + 1;
            if fail_nth > 0 && n % fail_nth == 0 {
                (
                    "500 Internal Server Error",
                    r#"{"message":"signup rejected"}"#.to_string(),
                )
            } else {
                (
                    "201 Created",
                    format!(
                        r#"{{"token":"token-{n}","userId":{n},"email":"u{n}@test.com","nickname":"u{n}"}}"#
                    ),
                )
            }
        }
        ("POST", "/api/rooms/group") | ("POST", "/api/rooms/direct") => {
            let id = rooms.fetch_add(1, Ordering::SeqCst) + 1;
            ("201 Created", format!(r#"{{"id":{id}}}"#))
        }
        ("POST", path) if path.ends_with("/join") => ("200 OK", "{}".to_string()),
        ("GET", "/api/rooms") => ("200 OK", "[]".to_string()),
        ("GET", path) if path.contains("/messages") => {
            ("200 OK", r#"{"messages":[],"hasNext":false}"#.to_string())
        }
        ("GET", _) => ("200 OK", "{}".to_string()),
        _ => ("404 Not Found", "{}".to_string()),
    }
}
