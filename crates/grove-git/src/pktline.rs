//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length, or "0000" for flush.

use crate::{GitError, Result};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest packet the protocol allows, length prefix included.
const MAX_PKT_LEN: usize = 65520;

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

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let len = data.len() + 4; // 4 bytes for the length prefix
                let mut result = format!("{:04x}", len).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
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

/// What a 4-byte length prefix announces.
enum Prefix {
    Special(PktLine),
    Data(usize),
}

fn decode_prefix(len_buf: &[u8; 4]) -> Result<Prefix> {
    let len_str = std::str::from_utf8(len_buf)
        .map_err(|_| GitError::InvalidPktLine("invalid length prefix".to_string()))?;

    match len_str {
        "0000" => Ok(Prefix::Special(PktLine::Flush)),
        "0001" => Ok(Prefix::Special(PktLine::Delimiter)),
        "0002" => Ok(Prefix::Special(PktLine::ResponseEnd)),
        _ => {
            if !len_str.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(GitError::InvalidPktLine(format!(
                    "invalid length: {:?}",
                    len_str
                )));
            }
            let len = usize::from_str_radix(len_str, 16)
                .map_err(|_| GitError::InvalidPktLine("invalid length".to_string()))?;

            if len < 4 {
                return Err(GitError::InvalidPktLine("length too small".to_string()));
            }
            if len > MAX_PKT_LEN {
                return Err(GitError::InvalidPktLine(format!("length too large: {len}")));
            }

            Ok(Prefix::Data(len - 4))
        }
    }
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or None at end of input.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match decode_prefix(&len_buf)? {
            Prefix::Special(pkt) => Ok(Some(pkt)),
            Prefix::Data(data_len) => {
                let mut data = vec![0u8; data_len];
                self.reader.read_exact(&mut data)?;
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Async reader for pkt-line format, used on socket and pipe transports.
pub struct AsyncPktLineReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> AsyncPktLineReader<R> {
    /// Creates a new async pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or None at end of input.
    pub async fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match decode_prefix(&len_buf)? {
            Prefix::Special(pkt) => Ok(Some(pkt)),
            Prefix::Data(data_len) => {
                let mut data = vec![0u8; data_len];
                self.reader.read_exact(&mut data).await?;
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet.
    pub async fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read().await? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
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

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
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

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode(), b"0000");
        assert_eq!(PktLine::Delimiter.encode(), b"0001");
        assert_eq!(PktLine::ResponseEnd.encode(), b"0002");
    }

    #[test]
    fn test_pktline_roundtrip() {
        let packets = vec![
            PktLine::from_string("hello\n"),
            PktLine::from_string("world\n"),
            PktLine::Flush,
        ];

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for pkt in &packets {
                writer.write(pkt).unwrap();
            }
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(reader.read().unwrap(), Some(packets[0].clone()));
        assert_eq!(reader.read().unwrap(), Some(packets[1].clone()));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Flush));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn test_pktline_as_str() {
        assert_eq!(PktLine::from_string("hello\n").as_str(), Some("hello"));
        assert_eq!(PktLine::from_string("no newline").as_str(), Some("no newline"));
        assert!(PktLine::from_bytes(vec![0xff, 0xfe]).as_str().is_none());
        assert!(PktLine::Flush.as_str().is_none());
    }

    #[test]
    fn test_pktline_read_until_flush() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("line1").unwrap();
            writer.write_line("line2").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("line3").unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let packets = reader.read_until_flush().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(reader.read().unwrap().unwrap().as_str(), Some("line3"));
    }

    #[test]
    fn test_pktline_writer_write_line_with_newline() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("test").unwrap();
            writer.write_line("test\n").unwrap();
        }
        assert_eq!(buf, b"0009test\n0009test\n");
    }

    #[test]
    fn test_pktline_read_special_packets() {
        let mut reader = PktLineReader::new(Cursor::new(b"00010002".to_vec()));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Delimiter));
        assert_eq!(reader.read().unwrap(), Some(PktLine::ResponseEnd));
    }

    #[test]
    fn test_pktline_read_invalid_length() {
        for bad in [&b"0003"[..], b"zzzz", b"+fff", b"ffff"] {
            let mut reader = PktLineReader::new(Cursor::new(bad.to_vec()));
            assert!(reader.read().is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn test_pktline_truncated_payload() {
        let mut reader = PktLineReader::new(Cursor::new(b"000ahel".to_vec()));
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_pktline_empty_data() {
        let pkt = PktLine::from_bytes(Vec::new());
        assert_eq!(pkt.encode(), b"0004");
        let mut reader = PktLineReader::new(Cursor::new(pkt.encode()));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Data(Vec::new())));
    }

    #[tokio::test]
    async fn test_async_reader_matches_sync_reader() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("first").unwrap();
            writer.write_data(b"\x01binary").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("after").unwrap();
        }

        let mut reader = AsyncPktLineReader::new(&buf[..]);
        let packets = reader.read_until_flush().await.unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].as_str(), Some("first"));
        assert_eq!(packets[1].data(), Some(&b"\x01binary"[..]));
        assert_eq!(reader.read().await.unwrap().unwrap().as_str(), Some("after"));
        assert_eq!(reader.read().await.unwrap(), None);
    }
}
