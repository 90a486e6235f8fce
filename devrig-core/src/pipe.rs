//! In-memory byte pipes backing every command's stdio endpoints.
//!
//! A command keeps the write ends for as long as it lives, so a reader taken
//! once by the UI survives restarts and sees the output of successive
//! subprocesses concatenated. EOF is observed only when every write end has
//! been dropped.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Creates a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            offset: 0,
        },
    )
}

/// Write end. Cloning yields another write end of the same pipe.
#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PipeWriter {
    /// Queues one chunk without blocking. Writes into a pipe whose reader is
    /// gone are dropped on the floor.
    pub fn send(&self, chunk: impl Into<Vec<u8>>) {
        let _ = self.tx.send(chunk.into());
    }

    /// Queues `line` followed by a newline.
    pub fn send_line(&self, line: &str) {
        let mut chunk = Vec::with_capacity(line.len() + 1);
        chunk.extend_from_slice(line.as_bytes());
        chunk.push(b'\n');
        let _ = self.tx.send(chunk);
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.tx.send(buf.to_vec()).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe reader dropped",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Read end. There is exactly one per pipe; commands hand it out once.
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let n = (this.pending.len() - this.offset).min(buf.remaining());
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                // All writers gone: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_write_then_read() {
        let (tx, mut rx) = pipe();
        tx.send_line("hello");
        let mut buf = [0u8; 16];
        let n = rx.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[tokio::test]
    async fn test_cloned_writers_share_the_pipe() {
        let (tx, rx) = pipe();
        let tx2 = tx.clone();
        tx.send_line("one");
        tx2.send_line("two");
        drop(tx);
        drop(tx2);

        let mut lines = BufReader::new(rx).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_after_all_writers_dropped() {
        let (tx, mut rx) = pipe();
        tx.send(b"bye".to_vec());
        drop(tx);

        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }

    #[tokio::test]
    async fn test_send_after_reader_dropped_is_ignored() {
        let (tx, rx) = pipe();
        drop(rx);
        tx.send_line("nobody home");
    }
}
