//! Byte-to-character decoding that can resume across buffer boundaries.
//!
//! A [`BufferDecoder`] decodes one character at a time from a byte slice and
//! reports [`Decoded::Incomplete`] when the slice ends inside a multi-byte
//! sequence. [`CharStream`] drives a decoder over any [`Read`], carrying the
//! undecoded tail of each chunk into the next one.

use std::io::{ErrorKind as IoErrorKind, Read};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    Char(char, usize),
    Incomplete,
}

pub trait BufferDecoder: Send {
    /// Decodes the character starting at `offset`.
    ///
    /// `stream_offset` is the absolute position of `buffer[0]` in the stream
    /// and is only used to report where a malformed sequence was found.
    fn get_char(&mut self, buffer: &[u8], offset: usize, stream_offset: u64) -> Result<Decoded>;

    /// Handles bytes left undecoded when the input ends.
    fn finish(&mut self, tail: &[u8], stream_offset: u64) -> Result<String> {
        Err(IngestError::Decode {
            offset: stream_offset,
            message: format!(
                "input ends inside a multi-byte sequence ({} trailing byte(s))",
                tail.len()
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    Big,
    Little,
}

/// What the UTF-8 decoder does with a byte that does not start a valid sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Utf8Fallback {
    #[default]
    Reject,
    /// Emit the offending byte as a single Latin-1 character and move on.
    RawByte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8(Utf8Fallback),
    Utf16(Option<ByteOrder>),
    Ascii,
    Latin1,
}

impl TextEncoding {
    pub fn decoder(self) -> Box<dyn BufferDecoder> {
        match self {
            TextEncoding::Utf8(fallback) => Box::new(Utf8Decoder::new(fallback)),
            TextEncoding::Utf16(order) => Box::new(Utf16Decoder::new(order)),
            TextEncoding::Ascii => Box::new(AsciiDecoder),
            TextEncoding::Latin1 => Box::new(Latin1Decoder),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8(_) => "utf-8",
            TextEncoding::Utf16(Some(ByteOrder::Little)) => "utf-16le",
            TextEncoding::Utf16(Some(ByteOrder::Big)) => "utf-16be",
            TextEncoding::Utf16(None) => "utf-16",
            TextEncoding::Ascii => "ascii",
            TextEncoding::Latin1 => "latin1",
        }
    }
}

fn decode_error(stream_offset: u64, offset: usize, message: String) -> IngestError {
    IngestError::Decode {
        offset: stream_offset + offset as u64,
        message,
    }
}

#[derive(Debug, Clone)]
pub struct Utf8Decoder {
    fallback: Utf8Fallback,
}

impl Utf8Decoder {
    pub fn new(fallback: Utf8Fallback) -> Self {
        Self { fallback }
    }

    fn invalid(&self, byte: u8, offset: usize, stream_offset: u64) -> Result<Decoded> {
        match self.fallback {
            Utf8Fallback::RawByte => Ok(Decoded::Char(char::from(byte), 1)),
            Utf8Fallback::Reject => Err(decode_error(
                stream_offset,
                offset,
                format!("invalid UTF-8 sequence starting with byte 0x{byte:02x}"),
            )),
        }
    }
}

impl BufferDecoder for Utf8Decoder {
    fn get_char(&mut self, buffer: &[u8], offset: usize, stream_offset: u64) -> Result<Decoded> {
        let Some(&lead) = buffer.get(offset) else {
            return Ok(Decoded::Incomplete);
        };
        let (len, initial) = match lead {
            0x00..=0x7f => return Ok(Decoded::Char(char::from(lead), 1)),
            0xc0..=0xdf => (2, u32::from(lead & 0x1f)),
            0xe0..=0xef => (3, u32::from(lead & 0x0f)),
            0xf0..=0xf7 => (4, u32::from(lead & 0x07)),
            _ => return self.invalid(lead, offset, stream_offset),
        };
        if buffer.len() - offset < len {
            // A truncated tail is only incomplete if what we have is well formed so far.
            let tail_ok = buffer[offset + 1..]
                .iter()
                .all(|b| b & 0xc0 == 0x80);
            return if tail_ok {
                Ok(Decoded::Incomplete)
            } else {
                self.invalid(lead, offset, stream_offset)
            };
        }
        let mut code = initial;
        for &byte in &buffer[offset + 1..offset + len] {
            if byte & 0xc0 != 0x80 {
                return self.invalid(lead, offset, stream_offset);
            }
            code = (code << 6) | u32::from(byte & 0x3f);
        }
        match char::from_u32(code) {
            Some(ch) => Ok(Decoded::Char(ch, len)),
            None => self.invalid(lead, offset, stream_offset),
        }
    }

    fn finish(&mut self, tail: &[u8], stream_offset: u64) -> Result<String> {
        match self.fallback {
            Utf8Fallback::RawByte => Ok(tail.iter().map(|&b| char::from(b)).collect()),
            Utf8Fallback::Reject => Err(decode_error(
                stream_offset,
                0,
                format!(
                    "input ends inside a multi-byte sequence ({} trailing byte(s))",
                    tail.len()
                ),
            )),
        }
    }
}

/// UTF-16 decoder whose byte order is fixed by the first BOM it sees.
///
/// The BOM itself is returned as U+FEFF; the tokenizer drops it.
#[derive(Debug, Clone)]
pub struct Utf16Decoder {
    order: Option<ByteOrder>,
    default_order: ByteOrder,
    bom_checked: bool,
}

impl Utf16Decoder {
    pub fn new(order: Option<ByteOrder>) -> Self {
        Self {
            order: None,
            default_order: order.unwrap_or(ByteOrder::Big),
            bom_checked: false,
        }
    }

    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.order
    }

    fn unit(order: ByteOrder, pair: &[u8]) -> u16 {
        match order {
            ByteOrder::Big => u16::from_be_bytes([pair[0], pair[1]]),
            ByteOrder::Little => u16::from_le_bytes([pair[0], pair[1]]),
        }
    }
}

impl BufferDecoder for Utf16Decoder {
    fn get_char(&mut self, buffer: &[u8], offset: usize, stream_offset: u64) -> Result<Decoded> {
        if buffer.len() < offset + 2 {
            return Ok(Decoded::Incomplete);
        }
        if !self.bom_checked {
            let detected = match (buffer[offset], buffer[offset + 1]) {
                (0xfe, 0xff) => Some(ByteOrder::Big),
                (0xff, 0xfe) => Some(ByteOrder::Little),
                _ => None,
            };
            self.bom_checked = true;
            self.order = Some(detected.unwrap_or(self.default_order));
            if detected.is_some() {
                debug!("UTF-16 byte order mark selects {:?} endian", self.order);
                return Ok(Decoded::Char('\u{feff}', 2));
            }
        }
        let order = self.order.unwrap_or(self.default_order);
        let first = Self::unit(order, &buffer[offset..offset + 2]);
        match first {
            0xd800..=0xdbff => {
                if buffer.len() < offset + 4 {
                    return Ok(Decoded::Incomplete);
                }
                let second = Self::unit(order, &buffer[offset + 2..offset + 4]);
                if !(0xdc00..=0xdfff).contains(&second) {
                    return Err(decode_error(
                        stream_offset,
                        offset,
                        format!("unpaired high surrogate 0x{first:04x}"),
                    ));
                }
                let code = 0x10000 + ((u32::from(first) - 0xd800) << 10) + (u32::from(second) - 0xdc00);
                char::from_u32(code)
                    .map(|ch| Decoded::Char(ch, 4))
                    .ok_or_else(|| {
                        decode_error(stream_offset, offset, format!("invalid code point 0x{code:x}"))
                    })
            }
            0xdc00..=0xdfff => Err(decode_error(
                stream_offset,
                offset,
                format!("unpaired low surrogate 0x{first:04x}"),
            )),
            unit => char::from_u32(u32::from(unit))
                .map(|ch| Decoded::Char(ch, 2))
                .ok_or_else(|| {
                    decode_error(stream_offset, offset, format!("invalid code unit 0x{unit:04x}"))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AsciiDecoder;

impl BufferDecoder for AsciiDecoder {
    fn get_char(&mut self, buffer: &[u8], offset: usize, stream_offset: u64) -> Result<Decoded> {
        match buffer.get(offset) {
            None => Ok(Decoded::Incomplete),
            Some(&byte) if byte > 127 => Err(decode_error(
                stream_offset,
                offset,
                format!("byte 0x{byte:02x} is outside the ASCII range"),
            )),
            Some(&byte) => Ok(Decoded::Char(char::from(byte), 1)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Latin1Decoder;

impl BufferDecoder for Latin1Decoder {
    fn get_char(&mut self, buffer: &[u8], offset: usize, _stream_offset: u64) -> Result<Decoded> {
        Ok(buffer
            .get(offset)
            .map_or(Decoded::Incomplete, |&byte| Decoded::Char(char::from(byte), 1)))
    }
}

/// Decodes a byte stream chunk by chunk.
pub struct CharStream<R> {
    reader: R,
    decoder: Box<dyn BufferDecoder>,
    chunk_size: usize,
    pending: Vec<u8>,
    /// Stream position of `pending[0]`.
    position: u64,
    bytes_read: u64,
    eof: bool,
}

impl<R: Read> CharStream<R> {
    pub fn new(reader: R, encoding: TextEncoding, chunk_size: usize) -> Self {
        Self {
            reader,
            decoder: encoding.decoder(),
            chunk_size: chunk_size.max(4),
            pending: Vec::new(),
            position: 0,
            bytes_read: 0,
            eof: false,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the next decoded chunk of text, or `None` once the input is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<String>> {
        loop {
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let tail = std::mem::take(&mut self.pending);
                let text = self.decoder.finish(&tail, self.position)?;
                self.position += tail.len() as u64;
                return Ok(Some(text));
            }
            let read = self.fill()?;
            if read == 0 {
                self.eof = true;
                continue;
            }
            let text = self.decode_pending()?;
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
    }

    fn fill(&mut self) -> Result<usize> {
        let start = self.pending.len();
        self.pending.resize(start + self.chunk_size, 0);
        let read = loop {
            match self.reader.read(&mut self.pending[start..]) {
                Ok(n) => break n,
                Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => {
                    self.pending.truncate(start);
                    return Err(IngestError::Decode {
                        offset: self.bytes_read,
                        message: format!("reading input failed: {err}"),
                    });
                }
            }
        };
        self.pending.truncate(start + read);
        self.bytes_read += read as u64;
        Ok(read)
    }

    fn decode_pending(&mut self) -> Result<String> {
        let mut text = String::with_capacity(self.pending.len());
        let mut offset = 0;
        while offset < self.pending.len() {
            match self
                .decoder
                .get_char(&self.pending, offset, self.position)?
            {
                Decoded::Char(ch, consumed) => {
                    text.push(ch);
                    offset += consumed;
                }
                Decoded::Incomplete => break,
            }
        }
        self.pending.drain(..offset);
        self.position += offset as u64;
        Ok(text)
    }
}
