//! Per-request byte counters.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes read from the client and written back to it.
///
/// Clones share the same counters, so relay tasks can each hold one.
#[derive(Debug, Clone, Default)]
pub struct ByteCounters {
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Wraps a reader so its bytes count towards [`ByteCounters::read`].
    pub fn reader<R>(&self, inner: R) -> CountingReader<R> {
        CountingReader {
            inner,
            count: self.read.clone(),
        }
    }

    /// Wraps a writer so its bytes count towards [`ByteCounters::written`].
    pub fn writer<W>(&self, inner: W) -> CountingWriter<W> {
        CountingWriter {
            inner,
            count: self.written.clone(),
        }
    }
}

pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            this.count.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }
}

pub struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W> CountingWriter<W> {
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            this.count.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counts_both_directions() {
        let counters = ByteCounters::new();

        let mut reader = counters.reader(&b"0009hello"[..]);
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();

        let mut writer = counters.writer(Vec::new());
        writer.write_all(b"0000").await.unwrap();

        assert_eq!(counters.read(), 9);
        assert_eq!(counters.written(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let counters = ByteCounters::new();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let counters = counters.clone();
            tasks.push(tokio::spawn(async move {
                let mut writer = counters.writer(tokio::io::sink());
                for _ in 0..100 {
                    writer.write_all(&[0u8; 10]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counters.written(), 4000);
    }
}
