use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Origin server answering canned responses by request path and recording every request head.
pub struct TestUpstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

pub struct TestUpstreamBuilder {
    routes: HashMap<String, Vec<u8>>,
}

impl TestUpstreamBuilder {
    pub fn route(mut self, path: &str, response: impl Into<Vec<u8>>) -> Self {
        self.routes.insert(path.to_string(), response.into());
        self
    }

    /// `200 OK` with the given content type and a fixed-length body.
    pub fn ok(self, path: &str, content_type: &str, body: &[u8]) -> Self {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        self.route(path, response)
    }

    pub async fn spawn(self) -> Result<TestUpstream> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let routes = Arc::new(self.routes);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let routes = routes.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, &routes, &recorded).await;
                });
            }
        });
        Ok(TestUpstream {
            addr,
            requests,
            handle,
        })
    }
}

impl TestUpstream {
    pub fn builder() -> TestUpstreamBuilder {
        TestUpstreamBuilder {
            routes: HashMap::new(),
        }
    }

    /// `http://127.0.0.1:<port><path>`
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    routes: &HashMap<String, Vec<u8>>,
    recorded: &Mutex<Vec<String>>,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    while reader.read_line(&mut head).await? > 0 && !head.ends_with("\r\n\r\n") {}
    let path = head.split(' ').nth(1).unwrap_or_default().to_owned();
    recorded.lock().push(head);

    let mut stream = reader.into_inner();
    let not_found: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    stream
        .write_all(routes.get(&path).map_or(not_found, Vec::as_slice))
        .await?;
    stream.shutdown().await.ok();
    Ok(())
}
