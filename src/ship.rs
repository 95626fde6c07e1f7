//! Ship node: the client-facing side of the link.
//!
//! Accepts plain HTTP proxy requests and CONNECT tunnels from local clients
//! and carries all of them over the single offshore link. Transactions are
//! strictly FIFO and one-at-a-time: one REQUEST frame goes out, the next
//! RESPONSE frame is that transaction's answer. That positional correlation
//! is the wire contract, so the scheduler never overlaps transactions.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use n0_error::{Result, ensure_any};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::HEADER_SECTION_MAX_LENGTH;
use crate::frame::FrameType;
use crate::link::{FrameReader, FrameSender, LinkError};
use crate::parse::{
    CONNECTION_ESTABLISHED, HttpRequest, HttpResponse, RequestKind, error_response,
};

/// Settings for the ship node.
#[derive(Debug, Clone)]
pub struct ShipConfig {
    /// Offshore node all traffic is carried through.
    pub offshore_host: String,
    pub offshore_port: u16,
    /// Pause between reconnect attempts after the link drops.
    pub reconnect_delay: Duration,
    /// How long a transaction may wait for the link before it fails with 502.
    pub request_timeout: Duration,
}

impl ShipConfig {
    pub fn new(offshore_host: impl Into<String>, offshore_port: u16) -> Self {
        Self {
            offshore_host: offshore_host.into(),
            offshore_port,
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }

    fn offshore_addr(&self) -> String {
        format!("{}:{}", self.offshore_host, self.offshore_port)
    }
}

/// Forward proxy that tunnels every client transaction over one offshore
/// link.
#[derive(Debug, Clone)]
pub struct ShipProxy {
    config: ShipConfig,
}

impl ShipProxy {
    pub fn new(config: ShipConfig) -> Self {
        Self { config }
    }

    /// Accepts client connections on `listener` and serves them until the
    /// future is dropped. The offshore link is established lazily and
    /// re-established with a delay whenever it drops.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();

        let (queue, queue_rx) = mpsc::channel(128);
        let scheduler = Scheduler {
            config: self.config.clone(),
            queue: queue_rx,
            pending: VecDeque::new(),
        };
        tokio::spawn(
            cancel_token
                .child_token()
                .run_until_cancelled_owned(scheduler.run())
                .instrument(error_span!("link")),
        );

        let mut id = 0u64;
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let queue = queue.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted client connection");
                        if let Err(err) = handle_client(stream, queue).await {
                            debug!("client connection failed: {err:#}");
                        }
                    })
                    .instrument(error_span!("client", id)),
            );
            id += 1;
        }
    }
}

/// One client request paired with its eventual client response.
struct Transaction {
    accepted_at: Instant,
    kind: TransactionKind,
}

enum TransactionKind {
    /// A serialized request awaiting its positionally correlated response.
    Exchange { wire: Bytes, client: TcpStream },
    /// A CONNECT: the raw request head plus any bytes the client pipelined
    /// behind it.
    Tunnel {
        connect: Bytes,
        head: Bytes,
        client: TcpStream,
    },
}

impl Transaction {
    fn client_mut(&mut self) -> &mut TcpStream {
        match &mut self.kind {
            TransactionKind::Exchange { client, .. } => client,
            TransactionKind::Tunnel { client, .. } => client,
        }
    }
}

/// Reads one request from a client connection and hands it to the scheduler.
async fn handle_client(mut stream: TcpStream, queue: mpsc::Sender<Transaction>) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let (header_len, request) =
        match HttpRequest::read(&mut stream, &mut buf, HEADER_SECTION_MAX_LENGTH).await {
            Ok(parsed) => parsed,
            Err(err) => {
                write_error_response(&mut stream, StatusCode::BAD_REQUEST, "malformed request")
                    .await
                    .ok();
                return Err(err);
            }
        };
    debug!(method = %request.method(), "read client request");
    let head = buf.split_to(header_len).freeze();

    let kind = match &request.kind {
        RequestKind::Connect { .. } => TransactionKind::Tunnel {
            connect: head,
            head: buf.freeze(),
            client: stream,
        },
        _ => {
            let body_len = match request.content_length() {
                Ok(len) => len,
                Err(err) => {
                    write_error_response(
                        &mut stream,
                        StatusCode::BAD_REQUEST,
                        "invalid Content-Length",
                    )
                    .await
                    .ok();
                    return Err(err);
                }
            };
            while buf.len() < body_len {
                let n = stream.read_buf(&mut buf).await?;
                ensure_any!(n > 0, "connection closed before end of request body");
            }
            let body = buf.split_to(body_len);
            TransactionKind::Exchange {
                wire: request.serialize(&body),
                client: stream,
            }
        }
    };

    let transaction = Transaction {
        accepted_at: Instant::now(),
        kind,
    };
    if let Err(send_err) = queue.send(transaction).await {
        let mut transaction = send_err.0;
        write_error_response(
            transaction.client_mut(),
            StatusCode::BAD_GATEWAY,
            "proxy is shutting down",
        )
        .await
        .ok();
    }
    Ok(())
}

async fn write_error_response(
    stream: &mut TcpStream,
    status: StatusCode,
    message: &str,
) -> std::io::Result<()> {
    stream.write_all(&error_response(status, message)).await?;
    stream.shutdown().await
}

/// The single worker that owns the link and processes transactions
/// one-at-a-time, plus the reconnect loop around it.
struct Scheduler {
    config: ShipConfig,
    queue: mpsc::Receiver<Transaction>,
    /// Transactions pulled off the channel while sweeping for expired ones.
    /// Survivors keep their order and are processed before new arrivals.
    pending: VecDeque<Transaction>,
}

impl Scheduler {
    async fn run(mut self) {
        let addr = self.config.offshore_addr();
        loop {
            let stream = loop {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => break stream,
                    Err(err) => {
                        debug!(%addr, "offshore connect failed: {err}");
                        self.fail_expired().await;
                        sleep(self.config.reconnect_delay).await;
                    }
                }
            };
            debug!(%addr, "link established");
            let (read_half, write_half) = stream.into_split();
            let (sender, writer_task) = FrameSender::spawn(write_half);
            let mut frames = FrameReader::new(read_half);
            let result = self.run_link(&sender, &mut frames).await;
            writer_task.abort();
            match result {
                Ok(()) => {
                    debug!("client queue closed, scheduler stopping");
                    return;
                }
                Err(err) => {
                    warn!("link lost: {err:#}");
                    self.fail_queued().await;
                    sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Processes transactions until the queue closes (`Ok`) or the link
    /// fails (`Err`).
    async fn run_link(
        &mut self,
        sender: &FrameSender,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), LinkError> {
        loop {
            let transaction = match self.pending.pop_front() {
                Some(transaction) => Some(transaction),
                None => tokio::select! {
                    item = self.queue.recv() => match item {
                        None => return Ok(()),
                        Some(transaction) => Some(transaction),
                    },
                    frame = frames.recv() => match frame? {
                        None => return Err(LinkError::Closed),
                        Some(frame) => {
                            warn!(ty = ?frame.ty, "ignoring unsolicited frame on idle link");
                            None
                        }
                    },
                },
            };
            let Some(mut transaction) = transaction else {
                continue;
            };
            if transaction.accepted_at.elapsed() >= self.config.request_timeout {
                debug!("transaction expired before reaching the link");
                write_error_response(
                    transaction.client_mut(),
                    StatusCode::BAD_GATEWAY,
                    "offshore link unavailable",
                )
                .await
                .ok();
                continue;
            }
            match transaction.kind {
                TransactionKind::Exchange { wire, client } => {
                    self.exchange(wire, client, sender, frames).await?
                }
                TransactionKind::Tunnel {
                    connect,
                    head,
                    client,
                } => self.tunnel(connect, head, client, sender, frames).await?,
            }
        }
    }

    /// Sends one REQUEST frame and returns the next RESPONSE frame's payload.
    async fn request_response(
        wire: Bytes,
        sender: &FrameSender,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<Bytes, LinkError> {
        sender.send(FrameType::Request, wire).await?;
        loop {
            match frames.recv().await? {
                None => return Err(LinkError::Closed),
                Some(frame) if frame.ty == FrameType::Response => return Ok(frame.payload),
                Some(_) => warn!("ignoring request frame sent by the offshore"),
            }
        }
    }

    async fn exchange(
        &self,
        wire: Bytes,
        mut client: TcpStream,
        sender: &FrameSender,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), LinkError> {
        let payload = match Self::request_response(wire, sender, frames).await {
            Ok(payload) => payload,
            Err(err) => {
                write_error_response(&mut client, StatusCode::BAD_GATEWAY, "offshore link closed")
                    .await
                    .ok();
                return Err(err);
            }
        };
        match HttpResponse::parse_with_len(&payload) {
            Ok(Some((_, response))) => {
                debug!(status = response.status.as_u16(), "forwarding response to client");
                // The payload is already canonical wire form; relay it whole.
                let flushed = async {
                    client.write_all(&payload).await?;
                    client.shutdown().await
                }
                .await;
                if let Err(err) = flushed {
                    debug!("client went away, response discarded: {err}");
                }
            }
            Ok(None) | Err(_) => {
                warn!("unparseable response payload from offshore");
                write_error_response(
                    &mut client,
                    StatusCode::BAD_GATEWAY,
                    "invalid upstream response",
                )
                .await
                .ok();
            }
        }
        Ok(())
    }

    /// Performs the CONNECT handshake over the link, then pumps tunnel bytes
    /// until both sides are done. Queued transactions wait: the worker is
    /// occupied for the whole tunnel lifetime.
    async fn tunnel(
        &self,
        connect: Bytes,
        head: Bytes,
        mut client: TcpStream,
        sender: &FrameSender,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), LinkError> {
        let payload = match Self::request_response(connect, sender, frames).await {
            Ok(payload) => payload,
            Err(err) => {
                write_error_response(&mut client, StatusCode::BAD_GATEWAY, "offshore link closed")
                    .await
                    .ok();
                return Err(err);
            }
        };
        let established = matches!(
            HttpResponse::parse_with_len(&payload),
            Ok(Some((_, response))) if response.status == StatusCode::OK
        );
        if !established {
            debug!("connect refused by offshore, relaying response verbatim");
            let _ = async {
                client.write_all(&payload).await?;
                client.shutdown().await
            }
            .await;
            return Ok(());
        }
        let client_dead = client.write_all(CONNECTION_ESTABLISHED).await.is_err();
        if !head.is_empty() {
            sender.send(FrameType::Request, head).await?;
        }
        self.tunnel_loop(client, client_dead, sender, frames).await
    }

    /// Bidirectional tunnel pump: the two directions run concurrently, so
    /// backpressure on one never stalls the other.
    ///
    /// A zero-length frame in either direction marks that direction's end of
    /// stream; real tunnel chunks are never empty since a zero-byte socket
    /// read means EOF. The tunnel is over once both marks were exchanged,
    /// which is also what keeps later message-mode frames unambiguous.
    async fn tunnel_loop(
        &self,
        client: TcpStream,
        client_dead: bool,
        sender: &FrameSender,
        frames: &mut FrameReader<OwnedReadHalf>,
    ) -> Result<(), LinkError> {
        let (mut client_read, mut client_write) = client.into_split();
        let done = CancellationToken::new();

        // Client → link. Owns this direction's close mark: exactly one empty
        // REQUEST frame, sent on client EOF or once the peer's mark arrived.
        let up = async {
            let pumped = if client_dead {
                Ok(())
            } else {
                let mut chunk = vec![0u8; 16 * 1024];
                loop {
                    let read = tokio::select! {
                        biased;
                        _ = done.cancelled() => break Ok(()),
                        read = client_read.read(&mut chunk) => read,
                    };
                    match read {
                        Ok(0) | Err(_) => break Ok(()),
                        Ok(n) => {
                            if let Err(err) = sender
                                .send(FrameType::Request, Bytes::copy_from_slice(&chunk[..n]))
                                .await
                            {
                                break Err(err);
                            }
                        }
                    }
                }
            };
            match pumped {
                Ok(()) => sender.send(FrameType::Request, Bytes::new()).await,
                Err(err) => Err(err),
            }
        };

        // Link → client. Ends at the peer's close mark.
        let down = async {
            let mut client_gone = false;
            loop {
                match frames.recv().await {
                    Err(err) => {
                        done.cancel();
                        client_write.shutdown().await.ok();
                        return Err(err);
                    }
                    Ok(None) => {
                        done.cancel();
                        client_write.shutdown().await.ok();
                        return Err(LinkError::Closed);
                    }
                    Ok(Some(frame)) if frame.ty == FrameType::Response => {
                        if frame.payload.is_empty() {
                            done.cancel();
                            client_write.shutdown().await.ok();
                            return Ok(());
                        }
                        if !client_gone && client_write.write_all(&frame.payload).await.is_err() {
                            // Client is gone; stop feeding it but keep
                            // draining the link so the close marks line up.
                            client_gone = true;
                            done.cancel();
                        }
                    }
                    Ok(Some(_)) => {
                        warn!("ignoring request frame sent by the offshore in tunnel mode")
                    }
                }
            }
        };

        let (up_result, down_result) = tokio::join!(up, down);
        debug!("tunnel closed, resuming queued transactions");
        down_result.and(up_result)
    }

    /// Moves everything off the channel and fails transactions that waited
    /// longer than the request timeout. Order of the survivors is preserved.
    async fn fail_expired(&mut self) {
        while let Ok(transaction) = self.queue.try_recv() {
            self.pending.push_back(transaction);
        }
        let mut kept = VecDeque::with_capacity(self.pending.len());
        while let Some(mut transaction) = self.pending.pop_front() {
            if transaction.accepted_at.elapsed() >= self.config.request_timeout {
                debug!("transaction timed out waiting for the link");
                write_error_response(
                    transaction.client_mut(),
                    StatusCode::BAD_GATEWAY,
                    "offshore link unavailable",
                )
                .await
                .ok();
            } else {
                kept.push_back(transaction);
            }
        }
        self.pending = kept;
    }

    /// Fails every queued transaction after the link dropped.
    async fn fail_queued(&mut self) {
        while let Ok(transaction) = self.queue.try_recv() {
            self.pending.push_back(transaction);
        }
        while let Some(mut transaction) = self.pending.pop_front() {
            write_error_response(
                transaction.client_mut(),
                StatusCode::BAD_GATEWAY,
                "offshore link closed",
            )
            .await
            .ok();
        }
    }
}
