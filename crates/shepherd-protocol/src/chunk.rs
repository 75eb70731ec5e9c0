//! Chunk framing for broker payloads.
//!
//! A chunk is a 4-byte ASCII type tag, a 32-bit big-endian body length, the
//! body bytes, and (when alignment is enabled and the body length is odd)
//! one zero pad byte.  The envelope layer stacks one `JSON` chunk and any
//! number of `BLOB` chunks to form a single broker message.
//!
//! Reading a chunk advances through three phases: header, body, close.  The
//! close phase skips any unread body bytes (plus the pad byte) so the next
//! chunk header starts immediately after, which lets a reader inspect the tag
//! and skip the body of chunk types it does not understand.

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;
use tracing::warn;

/// Length of the ASCII type tag, in bytes.
pub const TAG_LEN: usize = 4;

/// Tag of the chunk carrying the JSON-serialized envelope header.
pub const TAG_JSON: [u8; TAG_LEN] = *b"JSON";

/// Tag of a chunk carrying one opaque binary payload.
pub const TAG_BLOB: [u8; TAG_LEN] = *b"BLOB";

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// End of stream arrived inside a chunk header.  EOF is only legal at
    /// the header position, before any header byte has been read.
    #[error("truncated chunk header")]
    TruncatedHeader,
    /// End of stream arrived inside a chunk body.
    #[error("truncated chunk body")]
    TruncatedBody,
    #[error("chunk body exceeds the u32 length field ({0} bytes)")]
    BodyTooLarge(usize),
    #[error("read of {requested} bytes at offset {offset} exceeds body length {len}")]
    ReadOutOfBounds {
        requested: usize,
        offset: u32,
        len: u32,
    },
    #[error("seek target {target} outside body bounds 0..={len}")]
    SeekOutOfBounds { target: i64, len: u32 },
    #[error("chunk is closed")]
    Closed,
}

/// Write one chunk to `w` and flush.
///
/// The tag is the caller's responsibility: exactly four ASCII bytes,
/// left-padded or truncated as needed.
pub fn write_chunk<W: Write>(
    w: &mut W,
    tag: [u8; TAG_LEN],
    body: &[u8],
    align: bool,
) -> Result<(), ChunkError> {
    let len = u32::try_from(body.len()).map_err(|_| ChunkError::BodyTooLarge(body.len()))?;
    w.write_all(&tag)?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(body)?;
    if align && body.len() % 2 == 1 {
        w.write_all(&[0])?;
    }
    w.flush()?;
    Ok(())
}

/// A chunk being read from an underlying stream.
///
/// Holds a mutable borrow of the stream for its lifetime; construct, consume,
/// and [`close`](Chunk::close) one chunk before starting the next.
pub struct Chunk<'r, R: Read + Seek> {
    reader: &'r mut R,
    tag: [u8; TAG_LEN],
    len: u32,
    pos: u32,
    align: bool,
    closed: bool,
}

impl<'r, R: Read + Seek> Chunk<'r, R> {
    /// Read the next chunk header from `reader`.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no header bytes left);
    /// EOF anywhere inside the header is [`ChunkError::TruncatedHeader`].
    pub fn read_from(reader: &'r mut R, align: bool) -> Result<Option<Self>, ChunkError> {
        let mut tag = [0u8; TAG_LEN];
        // The first byte distinguishes a clean EOF from a truncated header.
        if reader.read(&mut tag[..1])? == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut tag[1..])
            .map_err(truncated_header)?;
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).map_err(truncated_header)?;
        Ok(Some(Chunk {
            reader,
            tag,
            len: u32::from_be_bytes(len_buf),
            pos: 0,
            align,
            closed: false,
        }))
    }

    pub fn tag(&self) -> [u8; TAG_LEN] {
        self.tag
    }

    pub fn body_len(&self) -> u32 {
        self.len
    }

    /// Current offset within the body.
    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Read exactly `n` bytes of the body.
    ///
    /// A read at or past the body end returns an empty buffer; a read that
    /// would run past the body end is [`ChunkError::ReadOutOfBounds`].
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, ChunkError> {
        if self.closed {
            return Err(ChunkError::Closed);
        }
        if self.pos >= self.len {
            return Ok(Vec::new());
        }
        let remaining = (self.len - self.pos) as usize;
        if n > remaining {
            return Err(ChunkError::ReadOutOfBounds {
                requested: n,
                offset: self.pos,
                len: self.len,
            });
        }
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).map_err(truncated_body)?;
        self.pos += n as u32;
        Ok(buf)
    }

    /// Read from the current offset to the body end.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, ChunkError> {
        let remaining = self.len.saturating_sub(self.pos) as usize;
        self.read(remaining)
    }

    /// Seek within the body.  The target must stay in `[0, body_len]`;
    /// seeking exactly to the body end is permitted.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u32, ChunkError> {
        if self.closed {
            return Err(ChunkError::Closed);
        }
        let target = match from {
            SeekFrom::Start(offset) => i64::try_from(offset).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => i64::from(self.pos) + delta,
            SeekFrom::End(delta) => i64::from(self.len) + delta,
        };
        if target < 0 || target > i64::from(self.len) {
            return Err(ChunkError::SeekOutOfBounds {
                target,
                len: self.len,
            });
        }
        let delta = target - i64::from(self.pos);
        if delta != 0 {
            self.reader.seek(SeekFrom::Current(delta))?;
        }
        self.pos = u32::try_from(target).unwrap_or(self.len);
        Ok(self.pos)
    }

    /// Close the chunk, skipping unread body bytes and the pad byte so the
    /// stream is positioned at the next chunk header.  Idempotent; reads and
    /// seeks after close fail with [`ChunkError::Closed`].
    pub fn close(&mut self) -> Result<(), ChunkError> {
        if self.closed {
            return Ok(());
        }
        let mut skip = i64::from(self.len) - i64::from(self.pos);
        if self.align && self.len % 2 == 1 {
            skip += 1;
        }
        if skip != 0 {
            self.reader.seek(SeekFrom::Current(skip))?;
        }
        self.closed = true;
        Ok(())
    }
}

/// Read every chunk from `reader` until end of stream, returning the
/// accumulated `(tag, body)` pairs.
///
/// A malformed or truncated chunk mid-stream is logged and terminates the
/// scan; the chunks decoded up to that point are returned.
pub fn read_all<R: Read + Seek>(reader: &mut R, align: bool) -> Vec<([u8; TAG_LEN], Vec<u8>)> {
    let mut chunks = Vec::new();
    loop {
        match Chunk::read_from(reader, align) {
            Ok(None) => break,
            Ok(Some(mut chunk)) => {
                let tag = chunk.tag();
                let body = chunk.read_remaining().and_then(|body| {
                    chunk.close()?;
                    Ok(body)
                });
                match body {
                    Ok(body) => chunks.push((tag, body)),
                    Err(error) => {
                        warn!(%error, "truncated chunk stream; returning partial chunk list");
                        break;
                    }
                }
            }
            Err(error) => {
                warn!(%error, "malformed chunk header; returning partial chunk list");
                break;
            }
        }
    }
    chunks
}

fn truncated_header(e: io::Error) -> ChunkError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ChunkError::TruncatedHeader
    } else {
        ChunkError::Io(e)
    }
}

fn truncated_body(e: io::Error) -> ChunkError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ChunkError::TruncatedBody
    } else {
        ChunkError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(tag: [u8; TAG_LEN], body: &[u8], align: bool) {
        let mut buf = Vec::new();
        write_chunk(&mut buf, tag, body, align).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());
        let mut chunk = Chunk::read_from(&mut cursor, align).unwrap().unwrap();
        assert_eq!(chunk.tag(), tag);
        assert_eq!(chunk.body_len() as usize, body.len());
        assert_eq!(chunk.read_remaining().unwrap(), body);
        chunk.close().unwrap();
        // Stream must be positioned immediately after the (optional) pad.
        assert_eq!(cursor.position() as usize, buf.len());
        assert!(Chunk::read_from(&mut cursor, align).unwrap().is_none());
    }

    #[test]
    fn roundtrip_plain_body() {
        roundtrip(TAG_JSON, b"{\"a\":1}", false);
    }

    #[test]
    fn roundtrip_zero_length_body() {
        roundtrip(TAG_BLOB, b"", false);
        roundtrip(TAG_BLOB, b"", true);
    }

    /// Odd body with alignment gets exactly one pad byte; without alignment
    /// none.
    #[test]
    fn odd_body_alignment_pad() {
        let mut aligned = Vec::new();
        write_chunk(&mut aligned, TAG_BLOB, b"abc", true).unwrap();
        assert_eq!(aligned.len(), TAG_LEN + 4 + 3 + 1);
        assert_eq!(*aligned.last().unwrap(), 0);

        let mut flat = Vec::new();
        write_chunk(&mut flat, TAG_BLOB, b"abc", false).unwrap();
        assert_eq!(flat.len(), TAG_LEN + 4 + 3);

        roundtrip(TAG_BLOB, b"abc", true);
    }

    #[test]
    fn header_is_tag_then_be_length() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_JSON, b"xy", false).unwrap();
        assert_eq!(&buf[..4], b"JSON");
        assert_eq!(&buf[4..8], &[0, 0, 0, 2]);
        assert_eq!(&buf[8..], b"xy");
    }

    #[test]
    fn partial_reads_track_offset() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_BLOB, b"hello world", false).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());
        let mut chunk = Chunk::read_from(&mut cursor, false).unwrap().unwrap();
        assert_eq!(chunk.read(5).unwrap(), b"hello");
        assert_eq!(chunk.position(), 5);
        assert_eq!(chunk.read(6).unwrap(), b" world");
        // At the body end every read returns empty.
        assert_eq!(chunk.read(10).unwrap(), b"");
        chunk.close().unwrap();
    }

    #[test]
    fn read_past_body_end_is_out_of_bounds() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_BLOB, b"abcd", false).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());
        let mut chunk = Chunk::read_from(&mut cursor, false).unwrap().unwrap();
        assert!(matches!(
            chunk.read(5),
            Err(ChunkError::ReadOutOfBounds { requested: 5, .. })
        ));
    }

    #[test]
    fn seek_within_body_bounds() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_BLOB, b"abcdef", false).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());
        let mut chunk = Chunk::read_from(&mut cursor, false).unwrap().unwrap();

        assert_eq!(chunk.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(chunk.read(2).unwrap(), b"ef");
        assert_eq!(chunk.seek(SeekFrom::Current(-6)).unwrap(), 0);
        assert_eq!(chunk.seek(SeekFrom::End(0)).unwrap(), 6);
        assert_eq!(chunk.seek(SeekFrom::End(-6)).unwrap(), 0);

        assert!(matches!(
            chunk.seek(SeekFrom::Start(7)),
            Err(ChunkError::SeekOutOfBounds { target: 7, len: 6 })
        ));
        assert!(matches!(
            chunk.seek(SeekFrom::Current(-1)),
            Err(ChunkError::SeekOutOfBounds { target: -1, .. })
        ));
        chunk.close().unwrap();
    }

    #[test]
    fn close_skips_unread_body_and_is_idempotent() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_BLOB, b"skip me", false).unwrap();
        write_chunk(&mut buf, TAG_JSON, b"{}", false).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());

        let mut first = Chunk::read_from(&mut cursor, false).unwrap().unwrap();
        first.close().unwrap();
        first.close().unwrap();
        assert!(matches!(first.read(1), Err(ChunkError::Closed)));
        drop(first);

        let mut second = Chunk::read_from(&mut cursor, false).unwrap().unwrap();
        assert_eq!(second.tag(), TAG_JSON);
        assert_eq!(second.read_remaining().unwrap(), b"{}");
        second.close().unwrap();
    }

    #[test]
    fn eof_inside_header_is_an_error() {
        let mut cursor = Cursor::new(&b"JS"[..]);
        assert!(matches!(
            Chunk::read_from(&mut cursor, false),
            Err(ChunkError::TruncatedHeader)
        ));
    }

    #[test]
    fn eof_inside_body_is_an_error() {
        // Header claims 8 body bytes but only 3 follow.
        let mut buf = Vec::new();
        buf.extend_from_slice(b"BLOB");
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf.as_slice());
        let mut chunk = Chunk::read_from(&mut cursor, false).unwrap().unwrap();
        assert!(matches!(
            chunk.read_remaining(),
            Err(ChunkError::TruncatedBody)
        ));
    }

    #[test]
    fn read_all_collects_chunks_until_eof() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_JSON, b"{}", false).unwrap();
        write_chunk(&mut buf, TAG_BLOB, &[0xff, 0x00], false).unwrap();
        let mut cursor = Cursor::new(buf.as_slice());
        let chunks = read_all(&mut cursor, false);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (TAG_JSON, b"{}".to_vec()));
        assert_eq!(chunks[1], (TAG_BLOB, vec![0xff, 0x00]));
    }

    /// One valid chunk followed by a truncated header yields the valid chunk
    /// only; a lone truncated header yields an empty list.
    #[test]
    fn read_all_returns_partial_list_on_truncation() {
        let mut buf = Vec::new();
        write_chunk(&mut buf, TAG_JSON, b"{}", false).unwrap();
        buf.extend_from_slice(b"BL");
        let mut cursor = Cursor::new(buf.as_slice());
        let chunks = read_all(&mut cursor, false);
        assert_eq!(chunks.len(), 1);

        let mut truncated = Cursor::new(&b"JS"[..]);
        assert!(read_all(&mut truncated, false).is_empty());
    }
}
