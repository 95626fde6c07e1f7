//! Offshore node: the internet-facing side of the link.
//!
//! Accepts ship links, consumes framed requests, executes them against
//! origin servers, and sends framed responses back. Each link gets its own
//! dispatcher; dispatchers never share state, so independent ships can be
//! served by one process.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};
use n0_error::{Result, StdResultExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::frame::FrameType;
use crate::link::{FrameReader, FrameSender, LinkError};
use crate::parse::{
    Authority, CONNECTION_ESTABLISHED, HttpRequest, RequestKind, error_response,
    filter_hop_by_hop_headers, synthesize_response,
};

/// Executes framed requests arriving from ship links.
#[derive(Debug, Clone)]
pub struct OffshoreProxy {
    http_client: reqwest::Client,
}

impl OffshoreProxy {
    pub fn new() -> Result<Self> {
        // A proxy must hand 3xx responses back to the client untouched.
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .anyerr()?;
        Ok(Self { http_client })
    }

    /// Accepts ship links on `listener` and serves each until it closes.
    ///
    /// Runs indefinitely; dropping the returned future tears down every
    /// active link and its origin sockets.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let http_client = self.http_client.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%remote_addr, "accepted link");
                        let (read_half, write_half) = stream.into_split();
                        let (sender, writer_task) = FrameSender::spawn(write_half);
                        let frames = FrameReader::new(read_half);
                        let dispatcher = LinkDispatcher {
                            sender,
                            http_client,
                            in_tunnel: false,
                            tunnel_upstream: None,
                        };
                        if let Err(err) = dispatcher.run(frames).await {
                            warn!("link failed: {err:#}");
                        } else {
                            debug!("link closed");
                        }
                        writer_task.abort();
                    })
                    .instrument(error_span!("link", id)),
            );
            id += 1;
        }
    }
}

/// Per-link request executor.
///
/// The link is in message mode or tunnel mode, never both: `in_tunnel` and
/// `tunnel_upstream` are only touched from `run`'s single task, which is what
/// keeps frame handling and tunnel state transitions serialized.
struct LinkDispatcher {
    sender: FrameSender,
    http_client: reqwest::Client,
    in_tunnel: bool,
    tunnel_upstream: Option<OwnedWriteHalf>,
}

impl LinkDispatcher {
    async fn run(mut self, mut frames: FrameReader<OwnedReadHalf>) -> Result<(), LinkError> {
        while let Some(frame) = frames.recv().await? {
            match frame.ty {
                FrameType::Response => warn!("ignoring response frame sent by the ship"),
                FrameType::Request if frame.payload.is_empty() => {
                    debug!("ignoring empty request frame in message mode");
                }
                FrameType::Request => self.handle_request(frame.payload, &mut frames).await?,
            }
        }
        debug!(in_tunnel = self.in_tunnel, "ship disconnected");
        Ok(())
    }

    async fn handle_request(
        &mut self,
        payload: Bytes,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), LinkError> {
        let (header_len, request) = match HttpRequest::parse_with_len(&payload) {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                warn!("truncated request on link");
                return self
                    .respond_error(StatusCode::INTERNAL_SERVER_ERROR, "truncated request")
                    .await;
            }
            Err(err) => {
                warn!("unparseable request on link: {err:#}");
                return self
                    .respond_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("invalid request: {err}"),
                    )
                    .await;
            }
        };
        let HttpRequest { kind, headers } = request;
        match kind {
            RequestKind::Connect { target } => self.run_tunnel(target, frames).await,
            RequestKind::Absolute { method, target } => {
                self.fetch_origin(method, target, headers, payload.slice(header_len..))
                    .await
            }
            RequestKind::Origin { method, path } => {
                // Origin-form reaches us when a client talks to the ship like
                // a plain HTTP server; the destination is the Host header.
                let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) else {
                    return self
                        .respond_error(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "origin-form request without a Host header",
                        )
                        .await;
                };
                let target = format!("http://{host}{path}");
                self.fetch_origin(method, target, headers, payload.slice(header_len..))
                    .await
            }
        }
    }

    /// Forwards one buffered request to the origin and frames the buffered
    /// response back. `reqwest` performs TLS when the target is `https`.
    async fn fetch_origin(
        &self,
        method: Method,
        target: String,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<(), LinkError> {
        debug!(%method, %target, body_len = body.len(), "origin request");
        filter_hop_by_hop_headers(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        let response = match self
            .http_client
            .request(method, target.as_str())
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%target, "origin request failed: {err}");
                return self
                    .respond_error(StatusCode::BAD_GATEWAY, &error_text(&err))
                    .await;
            }
        };
        let status = response.status();
        let response_headers = response.headers().clone();
        match response.bytes().await {
            Ok(body) => {
                debug!(status = status.as_u16(), body_len = body.len(), "origin response");
                self.sender
                    .send(
                        FrameType::Response,
                        synthesize_response(status, &response_headers, &body),
                    )
                    .await
            }
            Err(err) => {
                warn!(%target, "reading origin response failed: {err}");
                self.respond_error(StatusCode::BAD_GATEWAY, &error_text(&err))
                    .await
            }
        }
    }

    /// Serves one CONNECT tunnel, then restores message mode.
    ///
    /// A zero-length frame in either direction marks that direction's end of
    /// stream; real tunnel chunks are never empty since a zero-byte socket
    /// read means EOF. The tunnel is over once both marks were exchanged.
    async fn run_tunnel(
        &mut self,
        target: Authority,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), LinkError> {
        debug!(%target, "connect request: opening tunnel to origin");
        let upstream = match TcpStream::connect(target.to_addr()).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%target, "tunnel connect failed: {err}");
                return self
                    .respond_error(StatusCode::BAD_GATEWAY, &error_text(&err))
                    .await;
            }
        };
        let (mut up_read, up_write) = upstream.into_split();
        self.in_tunnel = true;
        self.tunnel_upstream = Some(up_write);
        self.sender
            .send(FrameType::Response, Bytes::from_static(CONNECTION_ESTABLISHED))
            .await?;
        debug!(%target, "tunnel established");

        let done = CancellationToken::new();
        let sender = self.sender.clone();

        // Origin → link. Owns this direction's close mark: exactly one empty
        // RESPONSE frame, sent on origin EOF or once the ship's mark arrived.
        let up = async {
            let mut chunk = vec![0u8; 16 * 1024];
            let pumped = loop {
                let read = tokio::select! {
                    biased;
                    _ = done.cancelled() => break Ok(()),
                    read = up_read.read(&mut chunk) => read,
                };
                match read {
                    Ok(0) | Err(_) => break Ok(()),
                    Ok(n) => {
                        if let Err(err) = sender
                            .send(FrameType::Response, Bytes::copy_from_slice(&chunk[..n]))
                            .await
                        {
                            break Err(err);
                        }
                    }
                }
            };
            match pumped {
                Ok(()) => sender.send(FrameType::Response, Bytes::new()).await,
                Err(err) => Err(err),
            }
        };

        // Link → origin. Ends at the ship's close mark.
        let down = async {
            loop {
                match frames.recv().await {
                    Err(err) => {
                        done.cancel();
                        return Err(err);
                    }
                    Ok(None) => {
                        done.cancel();
                        return Err(LinkError::Closed);
                    }
                    Ok(Some(frame)) if frame.ty == FrameType::Request => {
                        if frame.payload.is_empty() {
                            self.tunnel_upstream = None;
                            done.cancel();
                            return Ok(());
                        }
                        if let Some(upstream) = self.tunnel_upstream.as_mut() {
                            if upstream.write_all(&frame.payload).await.is_err() {
                                // Origin is gone; tunnel data is dropped
                                // silently until the read side reports it.
                                self.tunnel_upstream = None;
                            }
                        }
                    }
                    Ok(Some(_)) => warn!("ignoring response frame sent by the ship in tunnel mode"),
                }
            }
        };

        let (up_result, down_result) = tokio::join!(up, down);
        self.in_tunnel = false;
        self.tunnel_upstream = None;
        debug!("tunnel closed");
        down_result.and(up_result)
    }

    async fn respond_error(&self, status: StatusCode, message: &str) -> Result<(), LinkError> {
        self.sender
            .send(FrameType::Response, error_response(status, message))
            .await
    }
}

/// Flattens an error and its sources into one line for a response body.
fn error_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        text.push_str(": ");
        text.push_str(&err.to_string());
        source = err.source();
    }
    text
}
