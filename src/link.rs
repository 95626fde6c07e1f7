//! Frame transport over one TCP connection.
//!
//! A link owns exactly one [`FrameSender`] and one [`FrameReader`]. The
//! sender is the only writer: it runs a single loop that dequeues one frame
//! at a time, writes it, and flushes before touching the next, so frames from
//! concurrent callers never interleave on the wire. The reader is the only
//! consumer of the socket's read half and of the decoder behind it.

use std::collections::VecDeque;

use bytes::Bytes;
use n0_error::{AnyError, anyerr, stack_error};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameDecoder, FrameType, encode_frame};

/// Errors surfaced by the link transport.
#[stack_error(derive)]
pub enum LinkError {
    /// The peer disconnected. Fails the in-flight send and everything queued
    /// behind it.
    #[error("link closed")]
    Closed,
    /// The peer violated the framing rules. The byte stream is unrecoverable
    /// past this point.
    #[error("framing violation on link")]
    Protocol {
        #[error(source)]
        source: AnyError,
    },
}

struct Outbound {
    ty: FrameType,
    payload: Bytes,
    done: oneshot::Sender<Result<(), LinkError>>,
}

/// Handle for enqueueing frames on the link's single writer.
///
/// Cheaply cloneable. `send` resolves once the frame's bytes have been
/// written and flushed, which is what transitively paces the producers
/// feeding the link.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Outbound>,
}

impl FrameSender {
    /// Spawns the writer loop over `writer` and returns the send handle.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(write_loop(rx, writer));
        (Self { tx }, task)
    }

    /// Sends one frame. Completion means the bytes were handed off to the OS.
    pub async fn send(&self, ty: FrameType, payload: Bytes) -> Result<(), LinkError> {
        let (done, ack) = oneshot::channel();
        self.tx
            .send(Outbound { ty, payload, done })
            .await
            .map_err(|_| LinkError::Closed)?;
        ack.await.map_err(|_| LinkError::Closed)?
    }
}

async fn write_loop<W>(mut rx: mpsc::Receiver<Outbound>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        let frame = encode_frame(item.ty, &item.payload);
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                let _ = item.done.send(Ok(()));
            }
            Err(err) => {
                debug!("link write failed: {err}");
                let _ = item.done.send(Err(LinkError::Closed));
                // Fail everything still queued, then refuse new sends.
                rx.close();
                while let Ok(item) = rx.try_recv() {
                    let _ = item.done.send(Err(LinkError::Closed));
                }
                return;
            }
        }
    }
}

/// Reads frames off the link's read half.
///
/// `recv` returns `Ok(None)` on clean EOF and fails with
/// [`LinkError::Protocol`] when the decoder rejects the stream.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    pending: VecDeque<Frame>,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            chunk: vec![0u8; 64 * 1024].into_boxed_slice(),
        }
    }

    /// Returns the next frame on the link.
    pub async fn recv(&mut self) -> Result<Option<Frame>, LinkError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let n = match self.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    self.decoder.close();
                    return Ok(None);
                }
                Ok(n) => n,
                Err(err) => {
                    debug!("link read failed: {err}");
                    return Err(LinkError::Closed);
                }
            };
            match self.decoder.push(&self.chunk[..n]) {
                Ok(frames) => self.pending.extend(frames),
                Err(err) => {
                    warn!("dropping link: {err}");
                    return Err(LinkError::Protocol {
                        source: anyerr!(err),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let (client, server) = tokio::io::duplex(256);
        let (sender, _writer) = FrameSender::spawn(client);

        let mut tasks = Vec::new();
        for id in 0u8..4 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0u8..25 {
                    // Payload carries (id, seq) and a run of id bytes so a torn
                    // frame would be detected by content.
                    let mut payload = vec![id, seq];
                    payload.extend(std::iter::repeat_n(id, 64 + seq as usize));
                    sender
                        .send(FrameType::Request, Bytes::from(payload))
                        .await
                        .unwrap();
                }
            }));
        }

        let read_task = tokio::spawn(async move {
            let mut reader = FrameReader::new(server);
            let mut frames = Vec::new();
            while let Some(frame) = reader.recv().await.unwrap() {
                frames.push(frame);
            }
            frames
        });

        for task in tasks {
            task.await.unwrap();
        }
        drop(sender);

        let frames = read_task.await.unwrap();
        assert_eq!(frames.len(), 100);
        let mut next_seq = [0u8; 4];
        for frame in frames {
            let id = frame.payload[0];
            let seq = frame.payload[1];
            assert!(frame.payload[2..].iter().all(|b| *b == id));
            assert_eq!(frame.payload.len(), 2 + 64 + seq as usize);
            // Per-sender order is preserved even though senders interleave.
            assert_eq!(seq, next_seq[id as usize]);
            next_seq[id as usize] += 1;
        }
        assert_eq!(next_seq, [25; 4]);
    }

    #[tokio::test]
    async fn sends_fail_once_the_peer_is_gone() {
        let (client, server) = tokio::io::duplex(16);
        let (sender, _writer) = FrameSender::spawn(client);
        drop(server);

        let mut saw_error = false;
        for _ in 0..3 {
            if sender
                .send(FrameType::Request, Bytes::from_static(&[0u8; 1024]))
                .await
                .is_err()
            {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        // Once the writer has failed, every later send fails too.
        let res = sender.send(FrameType::Request, Bytes::new()).await;
        assert!(matches!(res, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn reader_reassembles_fragmented_frames() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_frame(FrameType::Response, b"first"));
        bytes.extend_from_slice(&encode_frame(FrameType::Request, b"second"));

        tokio::spawn(async move {
            for chunk in bytes.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = FrameReader::new(server);
        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first.ty, FrameType::Response);
        assert_eq!(&first.payload[..], b"first");
        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(second.ty, FrameType::Request);
        assert_eq!(&second.payload[..], b"second");
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_reports_clean_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.recv().await.unwrap().is_none());
    }
}
