//! End-to-end checks of the embedded file server over a real TCP socket,
//! speaking the same minimal HTTP/1.1 a cast device does.

use castfile::serve::{FileServer, ServedFile};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BODY: &[u8] = b"0123456789abcdefghij";

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn start_server(cancel: &CancellationToken) -> (FileServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("movie.mp4");
    std::fs::write(&path, BODY).unwrap();

    let server = FileServer::start(
        "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        vec![ServedFile {
            route: "/video",
            path,
            content_type: "video/mp4".to_string(),
        }],
        cancel.child_token()).await.unwrap();

    (server, dir)
}

async fn request(addr: SocketAddr, method: &str, path: &str, extra_headers: &str) -> Response {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();

    let req = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n{extra_headers}\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw.windows(4).position(|w| w == b"\r\n\r\n")
        .expect("no header/body separator in response");
    let head = std::str::from_utf8(&raw[..split]).unwrap();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Response { status, headers, body }
}

#[tokio::test]
async fn serves_full_body() {
    let cancel = CancellationToken::new();
    let (server, _dir) = start_server(&cancel).await;

    let resp = request(server.local_addr(), "GET", "/video", "").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("video/mp4"));
    assert_eq!(resp.header("accept-ranges"), Some("bytes"));
    assert_eq!(resp.header("access-control-allow-origin"), Some("*"));
    assert_eq!(resp.header("content-length"),
               Some(BODY.len().to_string().as_str()));
    assert_eq!(resp.body, BODY);

    cancel.cancel();
    server.join().await;
}

#[tokio::test]
async fn serves_byte_range() {
    let cancel = CancellationToken::new();
    let (server, _dir) = start_server(&cancel).await;
    let addr = server.local_addr();

    let resp = request(addr, "GET", "/video", "Range: bytes=5-9\r\n").await;
    assert_eq!(resp.status, 206);
    assert_eq!(resp.header("content-range"), Some("bytes 5-9/20"));
    assert_eq!(resp.body, &BODY[5..=9]);

    // Open-ended range runs to the end of the file.
    let resp = request(addr, "GET", "/video", "Range: bytes=15-\r\n").await;
    assert_eq!(resp.status, 206);
    assert_eq!(resp.header("content-range"), Some("bytes 15-19/20"));
    assert_eq!(resp.body, &BODY[15..]);

    cancel.cancel();
    server.join().await;
}

#[tokio::test]
async fn rejects_unsatisfiable_range() {
    let cancel = CancellationToken::new();
    let (server, _dir) = start_server(&cancel).await;

    let resp = request(server.local_addr(), "GET", "/video",
                       "Range: bytes=100-\r\n").await;
    assert_eq!(resp.status, 416);
    assert_eq!(resp.header("content-range"), Some("bytes */20"));
    assert!(resp.body.is_empty());

    cancel.cancel();
    server.join().await;
}

#[tokio::test]
async fn head_returns_headers_only() {
    let cancel = CancellationToken::new();
    let (server, _dir) = start_server(&cancel).await;

    let resp = request(server.local_addr(), "HEAD", "/video", "").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-length"),
               Some(BODY.len().to_string().as_str()));
    assert!(resp.body.is_empty());

    cancel.cancel();
    server.join().await;
}

#[tokio::test]
async fn unknown_path_is_404() {
    let cancel = CancellationToken::new();
    let (server, _dir) = start_server(&cancel).await;

    let resp = request(server.local_addr(), "GET", "/other", "").await;
    assert_eq!(resp.status, 404);

    cancel.cancel();
    server.join().await;
}
