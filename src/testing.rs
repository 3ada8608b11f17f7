//! A minimal HTTP server built on tokio that returns canned responses.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct MockServer {
    listener: TcpListener,
    pub base_url: String,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://127.0.0.1:{}", port);
        Self { listener, base_url }
    }

    /// Accept one connection, answer with `status` and a JSON `body`, and
    /// return the raw request bytes.
    pub async fn respond_once(self, status: u16, body: &str) -> Vec<u8> {
        let (mut stream, _) = self.listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        write_response(&mut stream, status, &[], body).await;
        request
    }

    /// Like [`respond_once`](Self::respond_once) but for a sequence of
    /// connections, one response each.
    pub async fn respond_many(self, responses: Vec<(u16, String)>) -> Vec<Vec<u8>> {
        let mut requests = Vec::with_capacity(responses.len());
        for (status, body) in responses {
            let (mut stream, _) = self.listener.accept().await.unwrap();
            requests.push(read_request(&mut stream).await);
            write_response(&mut stream, status, &[], &body).await;
        }
        requests
    }

    /// Accept one connection and never answer it.
    pub async fn hang_once(self) {
        let (stream, _) = self.listener.accept().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        drop(stream);
    }

    /// Answer with a redirect to `location`.
    pub async fn redirect_once(self, location: &str) -> Vec<u8> {
        let (mut stream, _) = self.listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        write_response(&mut stream, 301, &[("Location", location)], "").await;
        request
    }
}

async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if request_complete(&buf) {
            break;
        }
    }
    buf
}

fn request_complete(buf: &[u8]) -> bool {
    let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let body_len = buf.len() - header_end - 4;
    if let Some(length) = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
    {
        return body_len >= length;
    }
    if head.contains("transfer-encoding: chunked") {
        return buf.ends_with(b"0\r\n\r\n");
    }
    true
}

async fn write_response(stream: &mut TcpStream, status: u16, headers: &[(&str, &str)], body: &str) {
    let mut response = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        body.len()
    );
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(body);
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
}
