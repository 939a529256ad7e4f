//! One TCP connection to one server.
//!
//! The socket is split at connect time: the read half is wrapped in a
//! [`FrameReader`] that accumulates length-prefixed frames, and the
//! write half is owned by a dedicated writer task fed through an mpsc
//! channel. Producers send pre-framed buffers through a cloneable
//! [`WriterHandle`]; the channel serializes writes and its bound
//! provides backpressure. The writer drains ready frames into a batch
//! and flushes once per batch.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, ZkError};
use crate::protocol::FrameBuffer;

/// Socket read buffer size.
const READ_CHUNK: usize = 64 * 1024;

/// Writer channel capacity; sends wait when the queue is full.
const WRITE_QUEUE: usize = 256;

/// Maximum frames drained into a single write batch.
const MAX_BATCH_SIZE: usize = 64;

/// Open a connection and split it into its two halves.
///
/// Returns the frame reader, a handle for sending frames, and the
/// writer task's join handle (abort it to tear the writer down).
pub(crate) async fn connect(
    addr: &str,
    deadline: Duration,
) -> Result<(FrameReader, WriterHandle, JoinHandle<()>)> {
    let stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ZkError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            ))
        })??;
    stream.set_nodelay(true)?;

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITE_QUEUE);
    let task = tokio::spawn(write_loop(rx, write_half));

    Ok((FrameReader::new(read_half), WriterHandle { tx }, task))
}

/// Cheaply cloneable sender feeding the connection's writer task.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue a fully framed buffer for writing. Frames reach the wire
    /// in send order.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ZkError::ConnectionLoss { path: None })
    }
}

async fn write_loop(mut rx: mpsc::Receiver<Bytes>, mut writer: OwnedWriteHalf) {
    let mut batch: Vec<Bytes> = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => return,
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        for frame in &batch {
            if let Err(e) = writer.write_all(frame).await {
                tracing::debug!(error = %e, "socket write failed");
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "socket flush failed");
            return;
        }
    }
}

/// The connection's read half plus frame accumulation.
pub(crate) struct FrameReader {
    reader: OwnedReadHalf,
    buffer: FrameBuffer,
    ready: VecDeque<Bytes>,
    chunk: Vec<u8>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::new(),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Next complete frame payload, in server-send order.
    ///
    /// Fails with `ConnectionLoss` on clean EOF, `Io` on a socket
    /// error, and `Decode` on a malformed length prefix.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return Err(ZkError::ConnectionLoss { path: None });
            }
            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, FrameReader, WriterHandle, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = connect(&addr, Duration::from_secs(1));
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        let (reader, writer, task) = client.unwrap();
        (server.unwrap().0, reader, writer, task)
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (mut server, mut reader, _writer, _task) = pair().await;

        let mut bytes = framed(b"one");
        bytes.extend(framed(b"two"));
        server.write_all(&bytes).await.unwrap();

        assert_eq!(&reader.next_frame().await.unwrap()[..], b"one");
        assert_eq!(&reader.next_frame().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn writes_are_framed_and_ordered() {
        let (mut server, _reader, writer, _task) = pair().await;

        writer.send(Bytes::from(framed(b"abc"))).await.unwrap();
        writer.send(Bytes::from(framed(b"defg"))).await.unwrap();

        let mut buf = vec![0u8; framed(b"abc").len() + framed(b"defg").len()];
        server.read_exact(&mut buf).await.unwrap();

        let mut expected = framed(b"abc");
        expected.extend(framed(b"defg"));
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn peer_close_surfaces_connection_loss() {
        let (server, mut reader, _writer, _task) = pair().await;
        drop(server);

        assert!(matches!(
            reader.next_frame().await,
            Err(ZkError::ConnectionLoss { .. })
        ));
    }

    #[tokio::test]
    async fn send_after_writer_teardown_fails() {
        let (_server, _reader, writer, task) = pair().await;
        task.abort();
        let _ = task.await;

        let result = writer.send(Bytes::from(framed(b"x"))).await;
        assert!(matches!(result, Err(ZkError::ConnectionLoss { .. })));
    }

    #[tokio::test]
    async fn connect_refused_is_an_io_error() {
        // Bind and drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect(&addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ZkError::Io(_))));
    }
}
