//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length that counts the prefix
//! itself, or is one of the special packets "0000" (flush), "0001"
//! (delimiter) and "0002" (response end).

use crate::{GitError, Result};
use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of the hex prefix in front of every packet.
const PREFIX_LEN: usize = 4;

/// Largest packet git accepts, prefix included.
pub const MAX_PKT_LEN: usize = 65520;

const DEEPEN: &[u8] = b"deepen";

/// Side-band channel selector, written as the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Band {
    /// Pack data.
    Data = 1,
    /// Progress messages, printed by the client as `remote: ...`.
    Progress = 2,
    /// Fatal error; the client aborts.
    Error = 3,
}

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Creates a side-band packet: the band byte followed by the payload.
    pub fn sideband(band: Band, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(band as u8);
        data.extend_from_slice(payload);
        Self::Data(data)
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let mut result = format!("{:04x}", self.wire_len()).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
    }

    /// Number of bytes the packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Self::Data(data) => data.len() + PREFIX_LEN,
            _ => PREFIX_LEN,
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// What a length prefix announces.
enum Header {
    Flush,
    Delimiter,
    ResponseEnd,
    Data(usize),
}

impl Header {
    fn parse(prefix: &[u8; PREFIX_LEN]) -> Result<Self> {
        let text = std::str::from_utf8(prefix)
            .map_err(|_| GitError::Framing("length prefix is not ASCII".to_string()))?;
        let len = i32::from_str_radix(text, 16)
            .map_err(|_| GitError::Framing(format!("invalid length prefix {:?}", text)))?;

        match len {
            l if l < 0 => Err(GitError::Framing(format!("negative length {}", l))),
            0 => Ok(Self::Flush),
            1 => Ok(Self::Delimiter),
            2 => Ok(Self::ResponseEnd),
            3 => Err(GitError::Framing("length too small".to_string())),
            l => Ok(Self::Data(l as usize - PREFIX_LEN)),
        }
    }

    fn into_packet(self, data: Vec<u8>) -> PktLine {
        match self {
            Self::Flush => PktLine::Flush,
            Self::Delimiter => PktLine::Delimiter,
            Self::ResponseEnd => PktLine::ResponseEnd,
            Self::Data(_) => PktLine::Data(data),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Data(len) => *len,
            _ => 0,
        }
    }
}

fn incomplete_prefix(partial: &[u8]) -> GitError {
    GitError::Framing(format!(
        "incomplete length prefix {:?}",
        String::from_utf8_lossy(partial)
    ))
}

fn truncated(declared: usize, available: usize) -> GitError {
    GitError::Framing(format!(
        "truncated packet: declared {} payload bytes, got {}",
        declared, available
    ))
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

async fn fill_async<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Reader for pkt-line format.
///
/// `Ok(None)` means the stream ended cleanly on a packet boundary. Ending in
/// the middle of a prefix or payload is a framing error.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut prefix = [0u8; PREFIX_LEN];
        match fill(&mut self.reader, &mut prefix)? {
            0 => return Ok(None),
            PREFIX_LEN => {}
            n => return Err(incomplete_prefix(&prefix[..n])),
        }

        let header = Header::parse(&prefix)?;
        let len = header.payload_len();
        let mut data = vec![0u8; len];
        let n = fill(&mut self.reader, &mut data)?;
        if n < len {
            return Err(truncated(len, n));
        }

        Ok(Some(header.into_packet(data)))
    }
}

/// Async counterpart of [`PktLineReader`], used on sockets.
pub struct AsyncPktLineReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> AsyncPktLineReader<R> {
    /// Creates a new async pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    pub async fn read(&mut self) -> Result<Option<PktLine>> {
        let mut prefix = [0u8; PREFIX_LEN];
        match fill_async(&mut self.reader, &mut prefix).await? {
            0 => return Ok(None),
            PREFIX_LEN => {}
            n => return Err(incomplete_prefix(&prefix[..n])),
        }

        let header = Header::parse(&prefix)?;
        let len = header.payload_len();
        let mut data = vec![0u8; len];
        let n = fill_async(&mut self.reader, &mut data).await?;
        if n < len {
            return Err(truncated(len, n));
        }

        Ok(Some(header.into_packet(data)))
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet. Payloads that do not fit a single packet are rejected.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if pkt.wire_len() > MAX_PKT_LEN {
            return Err(GitError::Framing(format!(
                "packet of {} bytes exceeds the {} byte limit",
                pkt.wire_len(),
                MAX_PKT_LEN
            )));
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a payload on a side-band channel.
    pub fn write_sideband(&mut self, band: Band, data: &[u8]) -> Result<()> {
        self.write(&PktLine::sideband(band, data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Scans packets until one whose payload starts with `marker`.
///
/// Advisory only: malformed framing anywhere counts as "not found".
pub fn scan_for_prefix<R: Read>(reader: R, marker: &[u8]) -> bool {
    let mut reader = PktLineReader::new(reader);
    loop {
        match reader.read() {
            Ok(Some(PktLine::Data(data))) if data.starts_with(marker) => return true,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return false,
        }
    }
}

/// Returns true if an upload-pack request asks for a shallow history.
pub fn scan_deepen<R: Read>(reader: R) -> bool {
    scan_for_prefix(reader, DEEPEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn decode_all(bytes: &[u8]) -> Result<Vec<PktLine>> {
        let mut reader = PktLineReader::new(Cursor::new(bytes));
        let mut packets = Vec::new();
        while let Some(pkt) = reader.read()? {
            packets.push(pkt);
        }
        Ok(packets)
    }

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode(), b"0000");
        assert_eq!(PktLine::Delimiter.encode(), b"0001");
        assert_eq!(PktLine::ResponseEnd.encode(), b"0002");
    }

    #[test]
    fn test_decode_data_then_flush() {
        let packets = decode_all(b"0006ab0000").unwrap();
        assert_eq!(packets, vec![PktLine::from_bytes(b"ab".to_vec()), PktLine::Flush]);
    }

    #[test]
    fn test_decode_empty_stream() {
        assert!(decode_all(b"").unwrap().is_empty());
    }

    #[test]
    fn test_decode_incomplete_prefix() {
        let err = decode_all(b"0006ab00").unwrap_err();
        assert!(matches!(err, GitError::Framing(_)));
        assert!(err.to_string().contains("incomplete length prefix"));
    }

    #[test]
    fn test_decode_invalid_hex() {
        assert!(matches!(decode_all(b"zzzz"), Err(GitError::Framing(_))));
    }

    #[test]
    fn test_decode_negative_length() {
        let err = decode_all(b"-001abc").unwrap_err();
        assert!(err.to_string().contains("negative length"));
    }

    #[test]
    fn test_decode_length_too_small() {
        assert!(matches!(decode_all(b"0003"), Err(GitError::Framing(_))));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let err = decode_all(b"000aabc").unwrap_err();
        assert!(err.to_string().contains("truncated packet"));
    }

    #[test]
    fn test_decode_special_packets() {
        let packets = decode_all(b"000001000002").unwrap();
        assert_eq!(
            packets,
            vec![PktLine::Flush, PktLine::Delimiter, PktLine::ResponseEnd]
        );
    }

    #[test]
    fn test_pktline_writer_write_line_with_newline() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("test\n").unwrap();
        }
        assert_eq!(buf, b"0009test\n");
    }

    #[test]
    fn test_sideband_encoding() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_sideband(Band::Progress, b"hi\n").unwrap();
        }
        assert_eq!(buf, b"0008\x02hi\n");
    }

    #[test]
    fn test_writer_rejects_oversized_packet() {
        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        let result = writer.write_data(&vec![b'x'; MAX_PKT_LEN]);
        assert!(matches!(result, Err(GitError::Framing(_))));
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_pktline_as_str_invalid_utf8() {
        let pkt = PktLine::from_bytes(vec![0xff, 0xfe]);
        assert!(pkt.as_str().is_none());
    }

    #[test]
    fn test_pktline_empty_data() {
        let pkt = PktLine::from_bytes(Vec::new());
        assert_eq!(pkt.encode(), b"0004");
        assert_eq!(decode_all(b"0004").unwrap(), vec![pkt]);
    }

    #[test]
    fn test_scan_deepen() {
        assert!(scan_deepen(Cursor::new(b"000dsomething000cdeepen 10000")));
        assert!(scan_deepen(Cursor::new(b"000dsomething0000000cdeepen 1")));
        assert!(!scan_deepen(Cursor::new(b"000dsomething0000")));
    }

    #[test]
    fn test_scan_deepen_malformed_is_not_found() {
        assert!(!scan_deepen(Cursor::new(b"invalid data")));
        assert!(!scan_deepen(Cursor::new(b"deepen")));
        assert!(!scan_deepen(Cursor::new(b"000cdeepen")));
    }

    #[test]
    fn test_scan_for_other_marker() {
        let stream = b"0011command=fetch0001000cdeepen 20000";
        assert!(scan_for_prefix(Cursor::new(stream), b"command="));
        assert!(scan_for_prefix(Cursor::new(stream), b"deepen"));
        assert!(!scan_for_prefix(Cursor::new(stream), b"want "));
    }

    #[tokio::test]
    async fn test_async_reader() {
        let mut reader = AsyncPktLineReader::new(&b"0016sidechannel 12345\n0000"[..]);
        let pkt = reader.read().await.unwrap().unwrap();
        assert_eq!(pkt.as_str(), Some("sidechannel 12345"));
        assert_eq!(reader.read().await.unwrap(), Some(PktLine::Flush));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_async_reader_truncated() {
        let mut reader = AsyncPktLineReader::new(&b"0010short"[..]);
        assert!(matches!(reader.read().await, Err(GitError::Framing(_))));
    }

    fn packet_strategy() -> impl Strategy<Value = PktLine> {
        prop_oneof![
            4 => proptest::collection::vec(any::<u8>(), 0..512).prop_map(PktLine::Data),
            1 => Just(PktLine::Flush),
            1 => Just(PktLine::Delimiter),
            1 => Just(PktLine::ResponseEnd),
        ]
    }

    proptest! {
        #[test]
        fn test_decode_then_encode_is_identity(packets in proptest::collection::vec(packet_strategy(), 0..32)) {
            let wire: Vec<u8> = packets.iter().flat_map(PktLine::encode).collect();
            let decoded = decode_all(&wire).unwrap();
            let reencoded: Vec<u8> = decoded.iter().flat_map(PktLine::encode).collect();
            prop_assert_eq!(decoded, packets);
            prop_assert_eq!(reencoded, wire);
        }
    }
}
