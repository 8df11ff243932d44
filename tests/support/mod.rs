//! Fake in-process NNTP server used by the integration tests (SPEC_FULL.md
//! test-tooling section: "a fake in-process NNTP server drives the
//! connection-pool and fetcher tests without a real Usenet provider").
//!
//! Speaks just enough RFC 3977 to satisfy [`nntpvfs::nntp::NntpConnection`]:
//! greeting, `AUTHINFO USER`/`PASS`, `MODE READER`, `STAT`, `BODY`, `QUIT`.

use std::collections::HashMap;
use std::sync::Arc;

use nntpvfs::config::ProviderPriority;
use nntpvfs::provider::Provider;
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const YENC_SHIFT: u8 = 42;
const YENC_ESCAPE_SHIFT: u8 = 64;
const YENC_ESCAPE: u8 = b'=';

/// yEnc-encode one line of raw bytes, matching the decoder in
/// `nntpvfs::yenc`.
pub fn yenc_encode(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        let enc = b.wrapping_add(YENC_SHIFT);
        match enc {
            0x00 | 0x0A | 0x0D | YENC_ESCAPE => {
                out.push(YENC_ESCAPE);
                out.push(enc.wrapping_add(YENC_ESCAPE_SHIFT));
            }
            _ => out.push(enc),
        }
    }
    out
}

/// Build one complete single-part yEnc article body (ybegin/data/yend),
/// CRLF-terminated, ready to hand to [`FakeServer::set_article`].
pub fn build_article(name: &str, raw: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(raw);
    let mut body = Vec::new();
    body.extend_from_slice(format!("=ybegin line=128 size={} name={name}\r\n", raw.len()).as_bytes());
    body.extend_from_slice(&yenc_encode(raw));
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("=yend size={} crc32={crc:08x}\r\n", raw.len()).as_bytes());
    body
}

#[derive(Default)]
struct ServerState {
    /// message-id -> raw (not dot-stuffed) article body. Absent means the
    /// server answers 430 to STAT/BODY for that id.
    articles: HashMap<String, Vec<u8>>,
}

/// A fake NNTP server bound to an ephemeral localhost port. Dropping the
/// handle stops accepting new connections; already-open sockets finish
/// whatever request is in flight.
pub struct FakeServer {
    pub port: u16,
    state: Arc<RwLock<ServerState>>,
    shutdown: CancellationToken,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(RwLock::new(ServerState::default()));
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        let state = accept_state.clone();
                        tokio::spawn(handle_connection(socket, state));
                    }
                }
            }
        });

        FakeServer { port, state, shutdown }
    }

    /// Make `message_id` (without `<>`) resolve to `body` on STAT/BODY.
    pub fn set_article(&self, message_id: &str, body: Vec<u8>) {
        self.state.write().articles.insert(message_id.to_string(), body);
    }

    /// Build a [`Provider`] pointing at this server.
    pub fn provider(&self, name: &str, priority: ProviderPriority, max_connections: usize) -> Provider {
        Provider {
            name: Arc::from(name),
            host: Arc::from("127.0.0.1"),
            port: self.port,
            tls: false,
            username: None,
            password: None,
            max_connections,
            priority,
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    state: Arc<RwLock<ServerState>>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    if write_half.write_all(b"200 server ready\r\n").await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break;
        }
        let cmd = line.trim_end_matches(['\r', '\n']);
        if cmd.is_empty() {
            continue;
        }

        let upper = cmd.to_ascii_uppercase();
        if upper.starts_with("AUTHINFO USER") {
            let _ = write_half.write_all(b"381 more authentication required\r\n").await;
        } else if upper.starts_with("AUTHINFO PASS") {
            let _ = write_half.write_all(b"281 authentication accepted\r\n").await;
        } else if upper.starts_with("MODE READER") {
            let _ = write_half.write_all(b"200 reader mode, posting allowed\r\n").await;
        } else if upper.starts_with("STAT ") {
            let id = cmd[5..].trim();
            let exists = state.read().articles.contains_key(id);
            let resp = if exists {
                format!("223 0 {id} article exists\r\n")
            } else {
                format!("430 no such article {id}\r\n")
            };
            let _ = write_half.write_all(resp.as_bytes()).await;
        } else if upper.starts_with("BODY ") {
            let id = cmd[5..].trim();
            let body = state.read().articles.get(id).cloned();
            match body {
                Some(body) => {
                    let _ = write_half
                        .write_all(format!("222 0 {id} body follows\r\n").as_bytes())
                        .await;
                    let _ = write_half.write_all(&dot_stuff(&body)).await;
                    let _ = write_half.write_all(b".\r\n").await;
                }
                None => {
                    let _ = write_half
                        .write_all(format!("430 no such article {id}\r\n").as_bytes())
                        .await;
                }
            }
        } else if upper.starts_with("QUIT") {
            let _ = write_half.write_all(b"205 bye\r\n").await;
            break;
        } else {
            let _ = write_half.write_all(b"500 command not recognized\r\n").await;
        }
    }
}

/// RFC 3977 §3.1.1 dot-stuffing: any line starting with `.` gets a second
/// `.` prefixed before it goes on the wire.
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    out
}
