//! Async byte-stream link
//!
//! Bridges any `AsyncRead + AsyncWrite` (serial device, pipe, socket) to the
//! non-blocking [`Link`] contract. A reader task splits the stream on `\n` into
//! a bounded queue; a writer task drains an outbound queue, bounding every
//! write by a timeout. The control cycle only ever touches the queues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::{Link, LinkError};

/// Frames buffered per direction before the link pushes back
pub const LINK_QUEUE_DEPTH: usize = 64;

/// Longest accepted frame, newline excluded. Longer lines are discarded.
pub const MAX_FRAME_LEN: usize = 1024;

/// Link end backed by reader/writer tasks on the tokio runtime
pub struct StreamLink {
    name: String,
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl StreamLink {
    /// Start the I/O tasks for `stream`. Must be called within a tokio runtime.
    ///
    /// The tasks stop when `cancel` fires, when the stream reaches EOF or errors,
    /// or when a write exceeds `write_timeout`.
    pub fn spawn<S>(name: &str, stream: S, write_timeout: Duration, cancel: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let cancel = cancel.child_token();

        tokio::spawn(read_frames(
            name.to_string(),
            reader,
            in_tx,
            closed.clone(),
            dropped.clone(),
            cancel.clone(),
        ));
        tokio::spawn(write_frames(
            name.to_string(),
            writer,
            out_rx,
            write_timeout,
            closed.clone(),
            cancel.clone(),
        ));

        Self {
            name: name.to_string(),
            inbound: in_rx,
            outbound: out_tx,
            closed,
            dropped,
            cancel,
        }
    }

    /// Whether either I/O task has stopped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inbound frames discarded for being oversized or for a full queue
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Link for StreamLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_recv_line(&mut self) -> Result<Option<String>, LinkError> {
        match self.inbound.try_recv() {
            Ok(line) => Ok(Some(line)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(LinkError::Disconnected),
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        match self.outbound.try_send(line.trim_end().to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LinkError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(LinkError::Disconnected),
        }
    }
}

async fn read_frames<R>(
    name: String,
    reader: R,
    frames: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    // inside an oversized frame, skipping up to its newline
    let mut discarding = false;

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_FRAME_LEN as u64 + 1);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!(link = %name, "stream reached EOF");
                break;
            }
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if discarding {
                    discarding = !complete;
                    continue;
                }
                if !complete && buf.len() > MAX_FRAME_LEN {
                    tracing::warn!(link = %name, "frame exceeds {MAX_FRAME_LEN} bytes, discarding");
                    dropped.fetch_add(1, Ordering::Relaxed);
                    discarding = true;
                    continue;
                }

                // Invalid UTF-8 is passed on and rejected by the message decoder
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                match frames.try_send(line) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(link = %name, "inbound queue full, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                tracing::warn!(link = %name, "read failed: {e}");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}

async fn write_frames<W>(
    name: String,
    mut writer: W,
    mut frames: mpsc::Receiver<String>,
    write_timeout: Duration,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = frames.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };

        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(link = %name, "write failed: {e}");
                break;
            }
            Err(_) => {
                tracing::warn!(link = %name, "write exceeded {:?}, closing link", write_timeout);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_inbound_lines() {
        let (host_side, mut node_side) = tokio::io::duplex(1024);
        let mut link = StreamLink::spawn(
            "sensor",
            host_side,
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        node_side.write_all(b"first\nsecond\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(link.try_recv_line().unwrap().as_deref(), Some("first"));
        assert_eq!(link.try_recv_line().unwrap().as_deref(), Some("second"));
        assert_eq!(link.try_recv_line().unwrap(), None);
    }

    #[tokio::test]
    async fn appends_newline_on_send() {
        let (host_side, mut node_side) = tokio::io::duplex(1024);
        let mut link = StreamLink::spawn(
            "actuator",
            host_side,
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        link.send_line("take_over_sensor").unwrap();

        let mut buf = [0u8; 17];
        node_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"take_over_sensor\n");
    }

    #[tokio::test]
    async fn stalled_writer_closes_link() {
        // A 4-byte pipe that nobody drains stalls the writer
        let (host_side, _node_side) = tokio::io::duplex(4);
        let mut link = StreamLink::spawn(
            "actuator",
            host_side,
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        link.send_line(r#"{"cylinder":1,"injector":2.0,"ignition":10.0}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(link.is_closed());
        assert!(matches!(link.send_line("x"), Err(LinkError::Disconnected)));
    }

    #[tokio::test]
    async fn oversized_frame_is_discarded() {
        let (host_side, mut node_side) = tokio::io::duplex(8192);
        let mut link = StreamLink::spawn(
            "sensor",
            host_side,
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        let mut garbage = vec![b'x'; 4 * MAX_FRAME_LEN];
        garbage.push(b'\n');
        node_side.write_all(&garbage).await.unwrap();
        node_side.write_all(b"after\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(link.try_recv_line().unwrap().as_deref(), Some("after"));
        assert_eq!(link.try_recv_line().unwrap(), None);
        assert_eq!(link.dropped_frames(), 1);
        assert!(!link.is_closed());
    }

    #[tokio::test]
    async fn frame_at_limit_is_kept() {
        let (host_side, mut node_side) = tokio::io::duplex(4096);
        let mut link = StreamLink::spawn(
            "sensor",
            host_side,
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        let mut frame = vec![b'y'; MAX_FRAME_LEN];
        frame.push(b'\n');
        node_side.write_all(&frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(link.try_recv_line().unwrap().map(|l| l.len()), Some(MAX_FRAME_LEN));
        assert_eq!(link.dropped_frames(), 0);
    }
}
