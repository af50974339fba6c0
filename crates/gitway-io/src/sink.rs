//! Destinations for relayed response bytes.

use crate::GatedWriter;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Where backend output goes.
///
/// HTTP pack responses write through a [`GatedWriter`] so nothing is sent
/// before the request is read; full-duplex paths write straight through a
/// [`DirectSink`].
#[async_trait]
pub trait ResponseSink: Send {
    /// Writes all of `data`.
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Pushes out anything still held back.
    async fn finish(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for GatedWriter<W> {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.flush().await
    }
}

/// Sink that writes immediately.
pub struct DirectSink<W>(W);

impl<W> DirectSink<W> {
    pub fn new(inner: W) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> W {
        self.0
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for DirectSink<W> {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.0.flush().await
    }
}

#[async_trait]
impl<S: ResponseSink + ?Sized> ResponseSink for Box<S> {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).send(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        (**self).finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::couple;
    use tokio::io::AsyncReadExt;

    async fn send_all(sink: &mut dyn ResponseSink, parts: &[&[u8]]) -> io::Result<()> {
        for part in parts {
            sink.send(part).await?;
        }
        sink.finish().await
    }

    #[tokio::test]
    async fn test_direct_sink_passes_through() {
        let mut sink = DirectSink::new(Vec::new());
        send_all(&mut sink, &[&b"00"[..], &b"00"[..]]).await.unwrap();
        assert_eq!(sink.into_inner(), b"0000");
    }

    #[tokio::test]
    async fn test_gated_sink_through_trait_object() {
        let (mut reader, writer) = couple(&b"want"[..], Vec::new());
        let mut sink: Box<dyn ResponseSink> = Box::new(writer);
        send_all(&mut sink, &[&b"held"[..]]).await.unwrap();

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        send_all(&mut sink, &[&b" then direct"[..]]).await.unwrap();
    }

    #[tokio::test]
    async fn test_gated_sink_releases_in_order() {
        let (mut reader, mut writer) = couple(&b"want"[..], Vec::new());
        send_all(&mut writer, &[&b"held"[..]]).await.unwrap();
        assert!(writer.get_ref().is_empty());

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        send_all(&mut writer, &[&b" then direct"[..]]).await.unwrap();
        assert_eq!(writer.into_inner(), b"held then direct");
    }
}
