//! Scripted AIR server for end-to-end runs.
//!
//! Every route answers with a list of replies consumed in order, the last one
//! repeating. Besides JSON it can hang up, stay silent, or cut an archive short
//! of its declared `Content-Length`, which mock frameworks cannot do.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum Reply {
    Json(u16, Value),
    Archive(Vec<u8>),
    /// Declares `declared` bytes, sends `body`, then closes the connection.
    Truncated { declared: usize, body: Vec<u8> },
    /// Closes the connection without answering.
    Hangup,
    /// Keeps the connection open without ever answering.
    Stall,
}

#[derive(Default)]
struct Routes {
    replies: HashMap<String, Vec<Reply>>,
    hits: HashMap<String, usize>,
}

impl Routes {
    fn next_reply(&mut self, path: &str) -> Reply {
        let hit = self.hits.entry(path.to_string()).or_insert(0);
        *hit += 1;
        match self.replies.get(path) {
            Some(replies) if !replies.is_empty() => {
                let index = (*hit - 1).min(replies.len() - 1);
                replies[index].clone()
            }
            _ => Reply::Json(404, json!({"reason": format!("no route for {}", path)})),
        }
    }
}

pub struct ScriptedAir {
    addr: SocketAddr,
    routes: Arc<Mutex<Routes>>,
    _handle: JoinHandle<()>,
}

impl ScriptedAir {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let shared = routes.clone();

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, routes).await;
                });
            }
        });

        Self {
            addr,
            routes,
            _handle: handle,
        }
    }

    /// Registers the replies for `path`, e.g. `/api/login`.
    pub fn route(&self, path: &str, replies: Vec<Reply>) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .replies
            .insert(path.to_string(), replies);
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api/", self.addr)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.routes
            .lock()
            .unwrap()
            .hits
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Login, search, series and start all succeed; job `job-42` is created.
    pub fn with_submitted_job(&self) -> &Self {
        self.route(
            "/api/login",
            vec![Reply::Json(
                200,
                json!({
                    "token": {"jwt": "jwt-1"},
                    "user": {"projects": [{"id": 3, "name": "Research"}]}
                }),
            )],
        )
        .route(
            "/api/secure/search/query-data-source",
            vec![Reply::Json(
                200,
                json!({"exams": [{"accessionNumber": "E123", "studyInstanceUid": "1.2.3"}]}),
            )],
        )
        .route(
            "/api/secure/search/series",
            vec![Reply::Json(
                200,
                json!([
                    {"description": "AX T1 SPGR"},
                    {"description": "SAG FLAIR"},
                    {"description": "DWI"}
                ]),
            )],
        )
        .route(
            "/api/secure/search/download/start",
            vec![Reply::Json(200, json!({"downloadId": "job-42"}))],
        )
    }
}

pub fn status(value: &str) -> Reply {
    Reply::Json(200, json!({ "status": value }))
}

async fn serve(mut stream: TcpStream, routes: Arc<Mutex<Routes>>) -> std::io::Result<()> {
    let path = match read_request(&mut stream).await? {
        Some(path) => path,
        None => return Ok(()),
    };
    let reply = routes.lock().unwrap().next_reply(&path);

    match reply {
        Reply::Json(status, body) => {
            let body = body.to_string();
            write_head(&mut stream, status, "application/json", body.len()).await?;
            stream.write_all(body.as_bytes()).await?;
        }
        Reply::Archive(body) => {
            write_head(&mut stream, 200, "application/zip", body.len()).await?;
            stream.write_all(&body).await?;
        }
        Reply::Truncated { declared, body } => {
            write_head(&mut stream, 200, "application/zip", declared).await?;
            stream.write_all(&body).await?;
        }
        Reply::Hangup => return Ok(()),
        Reply::Stall => {
            tokio::time::sleep(Duration::from_secs(300)).await;
            return Ok(());
        }
    }
    stream.flush().await?;
    stream.shutdown().await
}

async fn write_head(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    content_length: usize,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status, content_type, content_length
    );
    stream.write_all(head.as_bytes()).await
}

/// Reads one request and returns its path without query string.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(position) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let path = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
    Ok(Some(path))
}
