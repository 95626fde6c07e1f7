use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Response bytes that complete a CONNECT handshake toward the client.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Host and port parsed from HTTP request targets.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl Authority {
    /// Parses an authority-form CONNECT target. A missing port defaults to
    /// 443, the overwhelmingly common CONNECT destination.
    pub fn from_connect_target(s: &str) -> Result<Self> {
        let uri = Uri::from_str(s).std_context("invalid connect target")?;
        ensure_any!(uri.scheme().is_none(), "expected target without scheme");
        let authority = uri.authority().context("expected target with authority")?;
        Ok(Self {
            host: authority.host().to_string(),
            port: authority.port_u16().unwrap_or(443),
        })
    }

    /// Address string suitable for `TcpStream::connect`.
    pub fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_connect_target(s)
    }
}

/// Request target classification per RFC 9110.
#[derive(Debug)]
pub enum RequestKind {
    /// CONNECT with an authority-form target.
    Connect { target: Authority },
    /// Absolute-form target carrying its own scheme and host.
    Absolute { method: Method, target: String },
    /// Origin-form target; the destination comes from the `Host` header.
    Origin { method: Method, path: String },
}

/// Parsed request line and header section of an HTTP/1.1 request.
#[derive(Debug)]
pub struct HttpRequest {
    pub kind: RequestKind,
    pub headers: HeaderMap,
}

impl HttpRequest {
    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                Self::from_httparse(req).map(|req| Some((header_len, req)))
            }
        }
    }

    fn from_httparse(req: httparse::Request<'_, '_>) -> Result<Self> {
        let method: Method = req
            .method
            .context("missing HTTP method")?
            .parse()
            .std_context("invalid HTTP method")?;
        let target = req.path.context("missing request target")?;
        let headers = HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(h.value).ok()?;
            Some((name, value))
        }));
        let kind = if method == Method::CONNECT {
            RequestKind::Connect {
                target: Authority::from_connect_target(target)?,
            }
        } else {
            let uri = Uri::from_str(target).std_context("invalid request target")?;
            if uri.scheme().is_some() {
                RequestKind::Absolute {
                    method,
                    target: target.to_string(),
                }
            } else {
                RequestKind::Origin {
                    method,
                    path: target.to_string(),
                }
            }
        };
        Ok(Self { kind, headers })
    }

    /// Reads from `reader` into `buf` until the header section is complete.
    ///
    /// Returns the length of the header section and the request. Everything
    /// read past the header section stays in `buf`: the start of the request
    /// body, or data the client pipelined behind a CONNECT.
    pub async fn read(
        reader: &mut (impl AsyncRead + Unpin),
        buf: &mut BytesMut,
        max_len: usize,
    ) -> Result<(usize, Self)> {
        loop {
            if let Some(parsed) = Self::parse_with_len(buf)? {
                return Ok(parsed);
            }
            ensure_any!(
                buf.len() < max_len,
                "header section exceeds {max_len} bytes"
            );
            let n = reader.read_buf(buf).await?;
            ensure_any!(n > 0, "connection closed before end of header section");
        }
    }

    pub fn method(&self) -> &Method {
        match &self.kind {
            RequestKind::Connect { .. } => &Method::CONNECT,
            RequestKind::Absolute { method, .. } => method,
            RequestKind::Origin { method, .. } => method,
        }
    }

    /// Declared body length. Requests without `Content-Length` carry no body
    /// here: chunked client bodies are not supported, they would have to be
    /// buffered anyway to cross the link as one blob.
    pub fn content_length(&self) -> Result<usize> {
        match self.headers.get(header::CONTENT_LENGTH) {
            None => Ok(0),
            Some(value) => value
                .to_str()
                .std_context("invalid Content-Length header")?
                .trim()
                .parse()
                .std_context("invalid Content-Length header"),
        }
    }

    /// Re-serializes the request into canonical HTTP/1.1 wire form.
    ///
    /// `Content-Length` is rewritten to match `body`; `Transfer-Encoding`
    /// never survives since the body travels as one length-known blob.
    pub fn serialize(&self, body: &[u8]) -> Bytes {
        let (method, target) = match &self.kind {
            RequestKind::Connect { target } => (&Method::CONNECT, target.to_string()),
            RequestKind::Absolute { method, target } => (method, target.clone()),
            RequestKind::Origin { method, path } => (method, path.clone()),
        };
        let mut out = BytesMut::with_capacity(256 + body.len());
        out.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
        for (name, value) in &self.headers {
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if !body.is_empty() || self.headers.contains_key(header::CONTENT_LENGTH) {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out.freeze()
    }
}

/// Parsed status line and header section of an HTTP/1.1 response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: HeaderMap,
}

impl HttpResponse {
    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("missing response status code")?;
                let status = StatusCode::from_u16(code).std_context("invalid status code")?;
                let reason = res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned);
                let headers = HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    HttpResponse {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }
}

/// Strips the headers that must not cross the proxy to the origin:
/// `Proxy-Connection`, `Connection`, and `Transfer-Encoding`.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    headers.remove("proxy-connection");
    headers.remove(header::CONNECTION);
    headers.remove(header::TRANSFER_ENCODING);
}

/// Builds the wire form of an origin response: status line, headers with the
/// hop-by-hop and length fields stripped, an accurate `Content-Length`, and
/// the buffered body.
pub fn synthesize_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
            || name == "proxy-connection"
        {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out.freeze()
}

/// Minimal `text/plain` response used for synthesized proxy errors.
pub fn error_response(status: StatusCode, message: &str) -> Bytes {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        message.len(),
        message,
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_target_with_port() {
        let authority = Authority::from_connect_target("example.com:8443").unwrap();
        assert_eq!(authority.host, "example.com");
        assert_eq!(authority.port, 8443);
        assert_eq!(authority.to_addr(), "example.com:8443");
    }

    #[test]
    fn connect_target_defaults_to_443() {
        let authority = Authority::from_connect_target("example.com").unwrap();
        assert_eq!(authority.port, 443);
    }

    #[test]
    fn connect_target_rejects_scheme() {
        assert!(Authority::from_connect_target("https://example.com:443").is_err());
    }

    #[test]
    fn classifies_absolute_and_origin_forms() {
        let (_, req) =
            HttpRequest::parse_with_len(b"GET http://example.com/a?b=c HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .unwrap()
                .unwrap();
        assert!(matches!(
            req.kind,
            RequestKind::Absolute { ref target, .. } if target == "http://example.com/a?b=c"
        ));

        let (_, req) = HttpRequest::parse_with_len(b"GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(matches!(req.kind, RequestKind::Origin { ref path, .. } if path == "/a"));
    }

    #[test]
    fn classifies_connect() {
        let (len, req) =
            HttpRequest::parse_with_len(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nextra")
                .unwrap()
                .unwrap();
        assert!(matches!(
            req.kind,
            RequestKind::Connect { ref target } if target.to_addr() == "example.com:443"
        ));
        // The header section ends before the pipelined bytes.
        assert_eq!(len, b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n".len());
    }

    #[test]
    fn partial_request_is_incomplete() {
        assert!(
            HttpRequest::parse_with_len(b"GET http://example.com/ HTTP/1.1\r\nHost: exa")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn content_length_parses_and_defaults() {
        let (_, req) = HttpRequest::parse_with_len(
            b"POST http://h/ HTTP/1.1\r\nHost: h\r\nContent-Length: 12\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(req.content_length().unwrap(), 12);

        let (_, req) = HttpRequest::parse_with_len(b"GET http://h/ HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.content_length().unwrap(), 0);
    }

    #[test]
    fn serialize_rewrites_length_and_drops_transfer_encoding() {
        let (_, req) = HttpRequest::parse_with_len(
            b"POST http://h/x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nContent-Length: 99\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        let wire = req.serialize(b"hello");
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("POST http://h/x HTTP/1.1\r\n"));
        assert!(text.contains("host: h\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn serialize_omits_length_for_bodyless_request() {
        let (_, req) = HttpRequest::parse_with_len(b"GET http://h/ HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap()
            .unwrap();
        let wire = req.serialize(b"");
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(!text.to_ascii_lowercase().contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn read_keeps_bytes_past_the_header_section() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client
                .write_all(b"CONNECT h:443 HTTP/1.1\r\nHost: h:443\r\n\r\n\x01\x02\x03")
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        let (header_len, req) = HttpRequest::read(&mut server, &mut buf, 8192).await.unwrap();
        assert!(matches!(req.kind, RequestKind::Connect { .. }));
        let head = buf.split_to(header_len);
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn response_parse_and_status_line() {
        let (len, res) = HttpResponse::parse_with_len(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap()
        .unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.status_line(), "HTTP/1.1 200 OK\r\n");
        assert_eq!(len, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n".len());
    }

    #[test]
    fn synthesize_strips_hop_by_hop_and_fixes_length() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        let wire = synthesize_response(StatusCode::OK, &headers, b"body");
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/html\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(!text.to_ascii_lowercase().contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\nbody"));
    }

    #[test]
    fn error_response_shape() {
        let wire = error_response(StatusCode::BAD_GATEWAY, "connection refused");
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("connection refused"));
    }
}
