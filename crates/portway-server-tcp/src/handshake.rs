//! HTTP CONNECT handshake
//!
//! Reads the request head of a freshly accepted connection and wraps it into a
//! [`ConnectSocket`]. The `200 Connection Established` reply is not sent here:
//! the tunnel sends it once the upstream connection is up, so that upstream
//! failures can still be reported as `502`/`504`.

use bytes::{Bytes, BytesMut};
use portway_core::ProxySocket;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Default upper bound for the request head
pub const DEFAULT_MAX_HEAD_BYTES: usize = 8 * 1024;

/// Protocol label reported for CONNECT sockets
pub const PROTOCOL_HTTP_CONNECT: &str = "http-connect";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const RESPONSE_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_METHOD_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_HEAD_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// CONNECT handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Client closed the connection before sending a complete request")]
    ClosedEarly,

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Malformed request: {0}")]
    Malformed(String),
}

impl HandshakeError {
    /// Response sent to the client before the connection is dropped
    fn response(&self) -> Option<&'static [u8]> {
        match self {
            HandshakeError::HeadTooLarge(_) => Some(RESPONSE_HEAD_TOO_LARGE),
            HandshakeError::MethodNotAllowed(_) => Some(RESPONSE_METHOD_NOT_ALLOWED),
            HandshakeError::Malformed(_) => Some(RESPONSE_BAD_REQUEST),
            HandshakeError::Io(_) | HandshakeError::ClosedEarly | HandshakeError::Timeout(_) => {
                None
            }
        }
    }
}

/// Client connection that asked to be tunnelled to `target`
#[derive(Debug)]
pub struct ConnectSocket {
    stream: TcpStream,
    peer_addr: SocketAddr,
    target: String,
    /// Bytes the client sent after the request head
    buffered: Bytes,
}

impl ConnectSocket {
    /// Requested destination in `host:port` form
    pub fn target_addr(&self) -> &str {
        &self.target
    }

    /// Split into the client stream, the target and any early client bytes
    pub fn into_parts(self) -> (TcpStream, String, Bytes) {
        (self.stream, self.target, self.buffered)
    }
}

impl ProxySocket for ConnectSocket {
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn target(&self) -> Option<&str> {
        Some(&self.target)
    }

    fn protocol(&self) -> &'static str {
        PROTOCOL_HTTP_CONNECT
    }
}

/// Run the CONNECT handshake on an accepted stream
///
/// Rejected requests get an HTTP error reply (best effort) before the error is
/// returned.
pub async fn accept_connect(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    max_head_bytes: usize,
    timeout: Duration,
) -> Result<ConnectSocket, HandshakeError> {
    let read = tokio::time::timeout(timeout, read_connect_request(&mut stream, max_head_bytes));
    let (target, buffered) = match read.await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            if let Some(response) = e.response() {
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            }
            return Err(e);
        }
        Err(_) => return Err(HandshakeError::Timeout(timeout)),
    };

    trace!(peer = %peer_addr, target = %target, "CONNECT request parsed");

    Ok(ConnectSocket {
        stream,
        peer_addr,
        target,
        buffered,
    })
}

/// Read a request head and return the CONNECT target plus trailing bytes
async fn read_connect_request<S>(
    stream: &mut S,
    max_head_bytes: usize,
) -> Result<(String, Bytes), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            let head_len = pos + HEAD_TERMINATOR.len();
            if head_len > max_head_bytes {
                return Err(HandshakeError::HeadTooLarge(max_head_bytes));
            }
            break head_len;
        }
        if buf.len() >= max_head_bytes {
            return Err(HandshakeError::HeadTooLarge(max_head_bytes));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::ClosedEarly);
        }
    };

    let head = buf.split_to(head_len);
    let target = parse_connect_target(&head)?;
    Ok((target, buf.freeze()))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Validate the request line and return the authority-form target
fn parse_connect_target(head: &[u8]) -> Result<String, HandshakeError> {
    let head = std::str::from_utf8(head)
        .map_err(|_| HandshakeError::Malformed("request head is not valid UTF-8".to_string()))?;
    let request_line = head.lines().next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => {
            return Err(HandshakeError::Malformed(format!(
                "invalid request line {:?}",
                request_line
            )))
        }
    };

    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::Malformed(format!(
            "unsupported HTTP version {}",
            version
        )));
    }

    if method != "CONNECT" {
        return Err(HandshakeError::MethodNotAllowed(method.to_string()));
    }

    let (host, port) = target.rsplit_once(':').ok_or_else(|| {
        HandshakeError::Malformed(format!("target {:?} is not in host:port form", target))
    })?;

    if host.is_empty() || host == "[]" {
        return Err(HandshakeError::Malformed(format!(
            "target {:?} has an empty host",
            target
        )));
    }

    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(target.to_string()),
        _ => Err(HandshakeError::Malformed(format!(
            "target {:?} has an invalid port",
            target
        ))),
    }
}
