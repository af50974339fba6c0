//! Request/response coupling.
//!
//! Some git clients deadlock if the server starts answering before it has
//! consumed the whole request. [`couple`] wraps a request source and a
//! response sink so that nothing reaches the sink until the source has hit
//! end-of-data or an error. Response bytes written before that point go to an
//! anonymous temporary file and are copied to the sink, in order, on the first
//! write or flush after the source drains.

use crate::error::StickyError;
use parking_lot::Mutex;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const SPILL_CHUNK: usize = 32 * 1024;

/// How the source ended.
#[derive(Debug, Clone)]
enum Terminal {
    Eof,
    Failed(StickyError),
}

type SharedTerminal = Arc<Mutex<Option<Terminal>>>;

/// Couples `source` and `sink`.
///
/// Spill files are created in the system temporary directory; see
/// [`GatedWriter::spill_in`] to choose another one.
pub fn couple<R, W>(source: R, sink: W) -> (GatedReader<R>, GatedWriter<W>) {
    let terminal: SharedTerminal = Arc::new(Mutex::new(None));
    let reader = GatedReader {
        inner: source,
        terminal: terminal.clone(),
    };
    let writer = GatedWriter {
        sink,
        terminal,
        spill: None,
        spill_dir: None,
        failed: None,
        released: false,
    };
    (reader, writer)
}

/// Source half of a coupled pair.
///
/// The first end-of-data or error is recorded; every later read replays it
/// without touching the wrapped source.
pub struct GatedReader<R> {
    inner: R,
    terminal: SharedTerminal,
}

impl<R> GatedReader<R> {
    /// Returns true once the source has ended.
    pub fn is_drained(&self) -> bool {
        self.terminal.lock().is_some()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for GatedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(terminal) = this.terminal.lock().clone() {
            return Poll::Ready(match terminal {
                Terminal::Eof => Ok(()),
                Terminal::Failed(err) => Err(err.to_io()),
            });
        }

        let asked = buf.remaining();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if asked > 0 && buf.filled().len() == before {
                    tracing::trace!("request body drained");
                    *this.terminal.lock() = Some(Terminal::Eof);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                tracing::debug!(error = %err, "request body failed");
                *this.terminal.lock() = Some(Terminal::Failed(StickyError::capture(&err)));
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sink half of a coupled pair.
pub struct GatedWriter<W> {
    sink: W,
    terminal: SharedTerminal,
    spill: Option<File>,
    spill_dir: Option<PathBuf>,
    failed: Option<StickyError>,
    released: bool,
}

impl<W> GatedWriter<W> {
    /// Creates spill files in `dir` instead of the system temporary directory.
    pub fn spill_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Returns true once the paired source has ended.
    pub fn is_drained(&self) -> bool {
        self.terminal.lock().is_some()
    }

    /// Returns true while writes are being held back in a spill file.
    pub fn is_spilling(&self) -> bool {
        self.spill.is_some()
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Returns the sink. Spilled bytes that were never flushed are lost.
    pub fn into_inner(self) -> W {
        self.sink
    }

    fn fail(&mut self, err: io::Error) -> io::Error {
        self.failed = Some(StickyError::capture(&err));
        err
    }
}

impl<W: AsyncWrite + Unpin> GatedWriter<W> {
    /// Writes all of `data`, either to the spill file or to the sink.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.to_io());
        }

        if !self.is_drained() {
            return match self.append_spill(data).await {
                Ok(()) => Ok(()),
                Err(err) => Err(self.fail(err)),
            };
        }

        if !self.released {
            self.flush().await?;
        }
        match self.sink.write_all(data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Copies any spilled bytes to the sink and flushes it.
    ///
    /// Safe to call at any time and repeatedly. Writes made before the source
    /// drains still spill afterwards.
    pub async fn flush(&mut self) -> io::Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.to_io());
        }

        let drained = self.is_drained();
        match self.release().await {
            Ok(()) => {
                if drained {
                    self.released = true;
                }
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn release(&mut self) -> io::Result<()> {
        if let Some(mut spill) = self.spill.take() {
            spill.flush().await?;
            spill.seek(SeekFrom::Start(0)).await?;
            let mut buf = vec![0u8; SPILL_CHUNK];
            let mut copied = 0usize;
            loop {
                let n = spill.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                self.sink.write_all(&buf[..n]).await?;
                copied += n;
            }
            tracing::debug!(bytes = copied, "released spilled response");
        }
        self.sink.flush().await
    }

    async fn append_spill(&mut self, data: &[u8]) -> io::Result<()> {
        if self.spill.is_none() {
            self.spill = Some(create_spill(self.spill_dir.clone()).await?);
        }
        match self.spill.as_mut() {
            Some(spill) => spill.write_all(data).await,
            None => Err(io::Error::other("spill file missing")),
        }
    }
}

/// Creates an anonymous temporary file. It has no name on disk and goes away
/// when dropped.
async fn create_spill(dir: Option<PathBuf>) -> io::Result<File> {
    let file = tokio::task::spawn_blocking(move || match dir {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    })
    .await
    .map_err(io::Error::other)??;
    Ok(File::from_std(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sink that records bytes and counts flushes.
    #[derive(Default)]
    struct RecordingSink {
        data: Vec<u8>,
        flushes: Arc<AtomicUsize>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.get_mut().data.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Source that fails on the first read.
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away")))
        }
    }

    #[tokio::test]
    async fn test_writes_held_until_source_drains() {
        let (mut reader, mut writer) = couple(&b"request"[..], Vec::new());

        writer.write(b"early ").await.unwrap();
        writer.write(b"bytes ").await.unwrap();
        assert!(writer.get_ref().is_empty());
        assert!(writer.is_spilling());

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"request");
        assert!(writer.is_drained());

        writer.write(b"late").await.unwrap();
        assert!(!writer.is_spilling());
        assert_eq!(writer.into_inner(), b"early bytes late");
    }

    #[tokio::test]
    async fn test_immediate_terminal_then_write_flushes() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink {
            data: Vec::new(),
            flushes: flushes.clone(),
        };
        let (mut reader, mut writer) = couple(Broken, sink);

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(reader.is_drained());

        writer.write(b"x").await.unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.get_ref().data, b"x");
    }

    #[tokio::test]
    async fn test_terminal_error_is_sticky() {
        let (mut reader, _writer) = couple(Broken, Vec::<u8>::new());
        let mut buf = [0u8; 8];
        for _ in 0..3 {
            let err = reader.read(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
            assert_eq!(err.to_string(), "client went away");
        }
    }

    #[tokio::test]
    async fn test_eof_is_sticky() {
        let (mut reader, _writer) = couple(&b""[..], Vec::<u8>::new());
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(reader.is_drained());
    }

    #[tokio::test]
    async fn test_explicit_flush_releases_early() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink {
            data: Vec::new(),
            flushes: flushes.clone(),
        };
        let (mut reader, mut writer) = couple(&b"abc"[..], sink);

        writer.write(b"held ").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.get_ref().data, b"held ");
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        // Still not drained: spills again.
        writer.write(b"again ").await.unwrap();
        assert!(writer.is_spilling());

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();

        writer.write(b"direct").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.get_ref().data, b"held again direct");
        assert_eq!(flushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_spill_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (mut reader, writer) = couple(&b"body"[..], Vec::new());
        let mut writer = writer.spill_in(dir.path());

        writer.write(b"spilled").await.unwrap();
        // Anonymous: nothing visible in the directory.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.into_inner(), b"spilled");
    }

    #[tokio::test]
    async fn test_spill_failure_is_sticky() {
        let (_reader, writer) = couple(&b"body"[..], Vec::new());
        let mut writer = writer.spill_in("/nonexistent/gitway/spill");

        let first = writer.write(b"a").await.unwrap_err();
        let second = writer.write(b"b").await.unwrap_err();
        assert_eq!(first.kind(), second.kind());
        assert!(writer.flush().await.is_err());
    }

    proptest! {
        #[test]
        fn test_sink_sees_writes_in_order(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..16),
            drain_at in 0usize..17,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let sink = runtime.block_on(async {
                let (mut reader, mut writer) = couple(&b"req"[..], Vec::new());
                for (i, chunk) in chunks.iter().enumerate() {
                    if i == drain_at {
                        let mut body = Vec::new();
                        reader.read_to_end(&mut body).await.unwrap();
                    }
                    writer.write(chunk).await.unwrap();
                }
                let mut body = Vec::new();
                reader.read_to_end(&mut body).await.unwrap();
                writer.flush().await.unwrap();
                writer.into_inner()
            });
            prop_assert_eq!(sink, chunks.concat());
        }
    }
}
