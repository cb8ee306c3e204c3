//! TBF: the typed binary framing used on the insert wire.
//!
//! Self-describing, supports maps, arrays, a fixed 2-element array marker
//! (used for `[ts, value]` pairs), signed 64-bit integers, doubles, and raw
//! byte strings. Every value is preceded by a one-byte tag so a reader never
//! needs an external schema to walk a document.
//!
//! This crate only knows how to tokenize and emit the framing itself; it has
//! no opinion on what a "series" or a "point" is — that belongs to the
//! decoder that consumes these tokens.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

pub const TAG_MAP_OPEN: u8 = 0x01;
pub const TAG_MAP_CLOSE: u8 = 0x02;
pub const TAG_ARRAY_OPEN: u8 = 0x03;
pub const TAG_ARRAY_CLOSE: u8 = 0x04;
pub const TAG_ARRAY2: u8 = 0x05;
pub const TAG_END: u8 = 0x06;
pub const TAG_INT: u8 = 0x10;
pub const TAG_FLOAT: u8 = 0x11;
pub const TAG_RAW: u8 = 0x12;

/// One decoded token from a TBF stream.
///
/// `Raw` borrows directly from the input buffer — the reader never copies a
/// byte string just to look at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'a> {
    MapOpen,
    MapClose,
    ArrayOpen,
    ArrayClose,
    /// Marks a fixed 2-element array, i.e. a `[ts, value]` point.
    Array2,
    /// Top-level document terminator.
    End,
    Int(i64),
    Float(f64),
    Raw(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of stream")]
    Eof,
    #[error("unknown tag byte 0x{0:02x}")]
    UnknownTag(u8),
    #[error("truncated raw payload: wanted {wanted} bytes, {available} available")]
    TruncatedRaw { wanted: usize, available: usize },
}

/// A cursor over a borrowed TBF byte stream.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek the next tag byte without consuming it. Returns `None` at EOF.
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn next_token(&mut self) -> Result<Token<'a>, WireError> {
        let tag = self.read_u8()?;
        match tag {
            TAG_MAP_OPEN => Ok(Token::MapOpen),
            TAG_MAP_CLOSE => Ok(Token::MapClose),
            TAG_ARRAY_OPEN => Ok(Token::ArrayOpen),
            TAG_ARRAY_CLOSE => Ok(Token::ArrayClose),
            TAG_ARRAY2 => Ok(Token::Array2),
            TAG_END => Ok(Token::End),
            TAG_INT => Ok(Token::Int(self.read_i64()?)),
            TAG_FLOAT => Ok(Token::Float(self.read_f64()?)),
            TAG_RAW => {
                let len = self.read_u32()? as usize;
                Ok(Token::Raw(self.take(len)?))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let b = *self.buf.get(self.pos).ok_or(WireError::Eof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_i64(&mut self) -> Result<i64, WireError> {
        let mut slice = self.buf.get(self.pos..).ok_or(WireError::Eof)?;
        let v = slice.read_i64::<BigEndian>().map_err(|_| WireError::Eof)?;
        self.pos += 8;
        Ok(v)
    }

    fn read_f64(&mut self) -> Result<f64, WireError> {
        let mut slice = self.buf.get(self.pos..).ok_or(WireError::Eof)?;
        let v = slice.read_f64::<BigEndian>().map_err(|_| WireError::Eof)?;
        self.pos += 8;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut slice = self.buf.get(self.pos..).ok_or(WireError::Eof)?;
        let v = slice.read_u32::<BigEndian>().map_err(|_| WireError::Eof)?;
        self.pos += 4;
        Ok(v)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::Eof)?;
        if end > self.buf.len() {
            return Err(WireError::TruncatedRaw {
                wanted: n,
                available: self.buf.len() - self.pos,
            });
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }
}

/// An append-only TBF document builder.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn map_open(&mut self) -> &mut Self {
        self.buf.push(TAG_MAP_OPEN);
        self
    }

    pub fn map_close(&mut self) -> &mut Self {
        self.buf.push(TAG_MAP_CLOSE);
        self
    }

    pub fn array_open(&mut self) -> &mut Self {
        self.buf.push(TAG_ARRAY_OPEN);
        self
    }

    pub fn array_close(&mut self) -> &mut Self {
        self.buf.push(TAG_ARRAY_CLOSE);
        self
    }

    pub fn array2(&mut self) -> &mut Self {
        self.buf.push(TAG_ARRAY2);
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.push(TAG_END);
        self
    }

    pub fn int(&mut self, v: i64) -> &mut Self {
        self.buf.push(TAG_INT);
        self.buf.write_i64::<BigEndian>(v).expect("Vec write never fails");
        self
    }

    pub fn float(&mut self, v: f64) -> &mut Self {
        self.buf.push(TAG_FLOAT);
        self.buf.write_f64::<BigEndian>(v).expect("Vec write never fails");
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.push(TAG_RAW);
        self.buf
            .write_u32::<BigEndian>(bytes.len() as u32)
            .expect("Vec write never fails");
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append another writer's completed bytes verbatim (used to splice a
    /// raw `name + points` fragment into a forward job).
    pub fn extend(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
