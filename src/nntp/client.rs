use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{CoreError, Result};
use crate::provider::Provider;

/// Anything the NNTP client can read/write bytes through, TLS or not.
trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A parsed NNTP status line, e.g. `222 0 <msg-id> body follows`.
#[derive(Debug, Clone)]
pub struct NntpStatusLine {
    pub code: u16,
    pub text: String,
}

/// One live connection to one provider. Not `Clone` — ownership is exactly
/// what the pool's idle stack / lease tracks.
pub struct NntpConnection {
    stream: BufReader<Box<dyn AsyncStream>>,
    pub provider_name: Arc<str>,
}

impl NntpConnection {
    /// Open a fresh connection: TCP connect, TLS handshake if configured,
    /// read the greeting, authenticate, and switch to reader mode.
    pub async fn connect(provider: &Provider) -> Result<Self> {
        let addr = format!("{}:{}", provider.host, provider.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| CoreError::ConnectionFault(format!("{addr}: {e}")))?;
        tcp.set_nodelay(true).ok();

        let boxed: Box<dyn AsyncStream> = if provider.tls {
            let connector = tls_connector();
            let server_name = ServerName::try_from(provider.host.to_string())
                .map_err(|_| CoreError::ConnectionFault(format!("invalid TLS name: {}", provider.host)))?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| CoreError::ConnectionFault(format!("TLS handshake failed: {e}")))?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let mut conn = NntpConnection {
            stream: BufReader::new(boxed),
            provider_name: provider.name.clone(),
        };

        let greeting = conn.read_status().await?;
        if greeting.code != 200 && greeting.code != 201 {
            return Err(CoreError::ConnectionFault(format!(
                "unexpected greeting: {} {}",
                greeting.code, greeting.text
            )));
        }

        if let Some(username) = &provider.username {
            let resp = conn.command(&format!("AUTHINFO USER {username}")).await?;
            if resp.code == 381 {
                let password = provider.password.as_deref().unwrap_or("");
                let resp = conn.command(&format!("AUTHINFO PASS {password}")).await?;
                if resp.code != 281 {
                    return Err(CoreError::ConnectionFault(format!(
                        "authentication rejected: {} {}",
                        resp.code, resp.text
                    )));
                }
            } else if resp.code != 281 {
                return Err(CoreError::ConnectionFault(format!(
                    "unexpected AUTHINFO USER response: {} {}",
                    resp.code, resp.text
                )));
            }
        }

        // MODE READER is required by some servers, a no-op on others; either
        // way the connection is usable afterwards so errors are swallowed.
        let _ = conn.command("MODE READER").await;

        Ok(conn)
    }

    /// Send a single-line command and read back its status line.
    pub async fn command(&mut self, line: &str) -> Result<NntpStatusLine> {
        self.write_line(line).await?;
        self.read_status().await
    }

    /// `STAT <message-id>`. Returns `true` if the article exists.
    pub async fn stat(&mut self, message_id: &str) -> Result<bool> {
        let resp = self.command(&format!("STAT {message_id}")).await?;
        match resp.code {
            223 => Ok(true),
            430 => Ok(false),
            code => Err(CoreError::ConnectionFault(format!(
                "unexpected STAT response: {code} {}",
                resp.text
            ))),
        }
    }

    /// `BODY <message-id>`. Returns the raw (dot-unstuffed) article body.
    pub async fn body(&mut self, message_id: &str) -> Result<Vec<u8>> {
        self.write_line(&format!("BODY {message_id}")).await?;
        let status = self.read_status().await?;
        match status.code {
            222 => self.read_dot_terminated().await,
            430 | 423 => Err(CoreError::ArticleNotFound {
                message_id: message_id.to_string(),
            }),
            code => Err(CoreError::ConnectionFault(format!(
                "unexpected BODY response: {code} {}",
                status.text
            ))),
        }
    }

    /// `BODY <message-id>`, but stop reading once at least `max_bytes` of
    /// decoded (dot-unstuffed) body have been collected. Used by
    /// [`crate::size_oracle`]'s fast analysis, which only needs the yEnc
    /// header line, not the full article (spec §4.4).
    ///
    /// Returns `(bytes, truncated)`. When `truncated` is `true` the
    /// connection's protocol state no longer lines up with a fresh command
    /// boundary — the caller must destroy it rather than return it to the
    /// pool.
    pub async fn body_prefix(&mut self, message_id: &str, max_bytes: usize) -> Result<(Vec<u8>, bool)> {
        self.write_line(&format!("BODY {message_id}")).await?;
        let status = self.read_status().await?;
        match status.code {
            222 => {}
            430 | 423 => {
                return Err(CoreError::ArticleNotFound {
                    message_id: message_id.to_string(),
                })
            }
            code => {
                return Err(CoreError::ConnectionFault(format!(
                    "unexpected BODY response: {code} {}",
                    status.text
                )))
            }
        }

        let mut out = Vec::new();
        loop {
            let line = self.read_line_bytes().await?;
            if line == b"." {
                return Ok((out, false));
            }
            if let Some(unstuffed) = line.strip_prefix(b"..") {
                out.push(b'.');
                out.extend_from_slice(unstuffed);
            } else {
                out.extend_from_slice(&line);
            }
            out.extend_from_slice(b"\n");
            if out.len() >= max_bytes {
                return Ok((out, true));
            }
        }
    }

    pub async fn quit(&mut self) {
        let _ = self.write_line("QUIT").await;
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stream
            .get_mut()
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| CoreError::ConnectionFault(e.to_string()))?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| CoreError::ConnectionFault(e.to_string()))
    }

    /// Read one CRLF/LF-terminated line as raw bytes, trailing newline
    /// stripped. Article bodies are 8-bit yEnc-encoded binary, so this must
    /// not go through a UTF-8 `String` — a single decoded byte like `0x92`
    /// is a lone continuation byte and trips `read_line`'s UTF-8 check.
    async fn read_line_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| CoreError::ConnectionFault(e.to_string()))?;
        if n == 0 {
            return Err(CoreError::ConnectionFault("connection closed by peer".into()));
        }
        while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Status lines (`222 0 <msg-id> ...`) are always ASCII, so decoding as
    /// UTF-8 here is safe and keeps the rest of the protocol layer on `str`.
    async fn read_status(&mut self) -> Result<NntpStatusLine> {
        let line = self.read_line_bytes().await?;
        let line = String::from_utf8(line)
            .map_err(|_| CoreError::ConnectionFault("non-ASCII status line".into()))?;
        let (code_str, text) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let code = code_str
            .parse::<u16>()
            .map_err(|_| CoreError::ConnectionFault(format!("malformed status line: {line}")))?;
        Ok(NntpStatusLine {
            code,
            text: text.to_string(),
        })
    }

    /// Read a multi-line block terminated by a lone `.` line, reversing
    /// RFC 3977 §3.1.1 dot-stuffing (`..` at line start becomes `.`). Body
    /// bytes are binary (yEnc) and must not round-trip through `String`.
    async fn read_dot_terminated(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let line = self.read_line_bytes().await?;
            if line == b"." {
                break;
            }
            if let Some(unstuffed) = line.strip_prefix(b"..") {
                out.push(b'.');
                out.extend_from_slice(unstuffed);
            } else {
                out.extend_from_slice(&line);
            }
            out.extend_from_slice(b"\n");
        }
        Ok(out)
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
