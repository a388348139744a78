use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// Transport limits for the request head; the read deadline covers the
/// request line and all headers together.
pub(super) const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_LINE_BYTES: usize = 8 * 1024;
const MAX_HEADER_BYTES: usize = 32 * 1024;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    http11: bool,
    headers: Vec<HeaderLine>,
}

#[derive(Debug)]
struct HeaderLine {
    lower_name: String,
    value: String,
}

impl RequestHead {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name == lower_name)
            .map(|header| header.value.as_str())
    }

    pub fn connection_close(&self) -> bool {
        if let Some(value) = self.header("connection") {
            let mut keep_alive = false;
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    return true;
                }
                if token.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
            if !self.http11 {
                return !keep_alive;
            }
            return false;
        }
        !self.http11
    }
}

/// Reads one HTTP/1.x request head. Returns `Ok(None)` when the client
/// closed the connection cleanly before sending another request.
pub(super) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + READ_HEADER_TIMEOUT;
    let mut line = String::new();

    let read = read_line_with_deadline(reader, &mut line, deadline, peer, MAX_REQUEST_LINE_BYTES)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    let request_line = line.trim_end_matches(['\r', '\n']);
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed request line from {peer}");
    };
    if parts.next().is_some() {
        bail!("malformed request line from {peer}");
    }
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| anyhow!("invalid request method from {peer}"))?;
    let http11 = match version {
        "HTTP/1.1" => true,
        "HTTP/1.0" => false,
        other => bail!("unsupported protocol version {other} from {peer}"),
    };
    let target = target.to_string();

    let mut headers = Vec::new();
    let mut header_bytes = 0usize;
    loop {
        let read =
            read_line_with_deadline(reader, &mut line, deadline, peer, MAX_HEADER_BYTES).await?;
        if read == 0 {
            bail!("connection closed while reading headers from {peer}");
        }
        header_bytes += read;
        if header_bytes > MAX_HEADER_BYTES {
            bail!("request headers exceed configured limit of {MAX_HEADER_BYTES} bytes for {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from {peer}"))?;
        let name = name.trim();
        if name.is_empty() {
            bail!("header name must not be empty from {peer}");
        }
        headers.push(HeaderLine {
            lower_name: name.to_ascii_lowercase(),
            value: value.trim().to_string(),
        });
    }

    Ok(Some(RequestHead {
        method,
        target,
        http11,
        headers,
    }))
}

async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out {context}"))?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn parses_basic_request() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer
            .write_all(b"GET /resize/200x200/a.jpg HTTP/1.1\r\nHost: localhost\r\nIf-None-Match: \"abc\"\r\n\r\n")
            .await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let head = read_request_head(&mut reader, peer())
            .await?
            .expect("expected request head");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/resize/200x200/a.jpg");
        assert_eq!(head.header("if-none-match"), Some("\"abc\""));
        assert!(!head.connection_close());
        Ok(())
    }

    #[tokio::test]
    async fn clean_eof_yields_none() -> Result<()> {
        let (client, writer) = duplex(64);
        drop(writer);
        let mut reader = BufReader::new(client);
        assert!(read_request_head(&mut reader, peer()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_long_request_line() -> Result<()> {
        let (client, mut writer) = duplex(32 * 1024);
        let request = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(16 * 1024));
        writer.write_all(request.as_bytes()).await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let err = read_request_head(&mut reader, peer())
            .await
            .expect_err("line should exceed limit");
        assert!(err.to_string().contains("exceeds configured limit"));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_malformed_request_line() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer.write_all(b"GET /only-two-tokens\r\n\r\n").await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        assert!(read_request_head(&mut reader, peer()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn connection_close_header_is_honoured() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let head = read_request_head(&mut reader, peer()).await?.unwrap();
        assert!(head.connection_close());
        Ok(())
    }

    #[tokio::test]
    async fn http10_defaults_to_close() -> Result<()> {
        let (client, mut writer) = duplex(1024);
        writer.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
        drop(writer);

        let mut reader = BufReader::new(client);
        let head = read_request_head(&mut reader, peer()).await?.unwrap();
        assert!(head.connection_close());
        Ok(())
    }
}
