//! Per-channel compression filters
//!
//! Light channels carry one LZ4 frame, heavy channels one zstd stream.
//! Every write is flushed so the peer can decode it as soon as the packets
//! arrive; a write may still span several packets, so the inbound side
//! accepts its input in arbitrary pieces. A filter carries dictionary state
//! and is rebuilt whenever its channel is reopened.

use super::channel_type::CompressionMode;
use crate::error::{Result, TunnelError};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io::{self, Read, Write};
use zstd::stream::raw::{
    Decoder as ZstdDecoder, Encoder as ZstdEncoder, InBuffer, Operation, OutBuffer,
};

const ZSTD_LEVEL: i32 = 9;
const SCRATCH_LEN: usize = 16 * 1024;

const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
const LZ4_MAX_BLOCK: usize = 4 * 1024 * 1024;
const LZ4_FLAG_DICT_ID: u8 = 0x01;
const LZ4_FLAG_CONTENT_CHECKSUM: u8 = 0x04;
const LZ4_FLAG_CONTENT_SIZE: u8 = 0x08;
const LZ4_FLAG_BLOCK_CHECKSUM: u8 = 0x10;

fn codec_error(what: &str, e: impl std::fmt::Display) -> TunnelError {
    TunnelError::Framing(format!("{} failed: {}", what, e))
}

enum Encoder {
    Lz4(FrameEncoder<Vec<u8>>),
    Zstd(ZstdEncoder<'static>),
}

impl Encoder {
    fn new(mode: CompressionMode) -> Result<Self> {
        Ok(match mode {
            CompressionMode::Heavy => Encoder::Zstd(
                ZstdEncoder::new(ZSTD_LEVEL).map_err(|e| codec_error("zstd setup", e))?,
            ),
            _ => Encoder::Lz4(FrameEncoder::new(Vec::new())),
        })
    }

    fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Encoder::Lz4(encoder) => {
                encoder.write_all(input)?;
                encoder.flush()?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            Encoder::Zstd(encoder) => {
                let mut out = Vec::with_capacity(input.len() / 2 + 64);
                let mut scratch = [0u8; SCRATCH_LEN];
                let mut source = InBuffer::around(input);
                while source.pos() < input.len() {
                    let written = {
                        let mut sink = OutBuffer::around(&mut scratch[..]);
                        encoder.run(&mut source, &mut sink)?;
                        sink.pos()
                    };
                    out.extend_from_slice(&scratch[..written]);
                }
                loop {
                    let (written, remaining) = {
                        let mut sink = OutBuffer::around(&mut scratch[..]);
                        let remaining = encoder.flush(&mut sink)?;
                        (sink.pos(), remaining)
                    };
                    out.extend_from_slice(&scratch[..written]);
                    if remaining == 0 {
                        return Ok(out);
                    }
                }
            }
        }
    }
}

/// Outbound filter
pub struct Compressor {
    mode: CompressionMode,
    encoder: Option<Encoder>,
}

impl Compressor {
    /// Build a filter for `mode`, `None` when compression is off
    pub fn for_mode(mode: CompressionMode) -> Option<Self> {
        (mode != CompressionMode::None).then(|| Compressor {
            mode,
            encoder: None,
        })
    }

    /// Compress `input` and flush it into the returned bytes
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => Encoder::new(self.mode)?,
        };
        self.encoder
            .insert(encoder)
            .compress(input)
            .map_err(|e| codec_error("compression", e))
    }
}

/// Whole frame units handed to the LZ4 decoder
///
/// Runs dry only at a unit boundary, so the decoder never sees half a block.
#[derive(Default)]
struct Units {
    data: Vec<u8>,
    pos: usize,
}

impl Units {
    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.is_empty() {
            self.data.clear();
            self.pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }
}

impl Read for Units {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct Lz4Inflater {
    decoder: FrameDecoder<Units>,
    /// Bytes of an incomplete header or block
    pending: Vec<u8>,
    /// Flags of the frame being read, `None` before its header
    flags: Option<u8>,
}

impl Lz4Inflater {
    fn new() -> Self {
        Lz4Inflater {
            decoder: FrameDecoder::new(Units::default()),
            pending: Vec::new(),
            flags: None,
        }
    }

    /// Length of the complete unit at `at`, if it has fully arrived
    fn unit_len(&mut self, at: usize) -> Result<Option<usize>> {
        let bytes = &self.pending[at..];
        match self.flags {
            None => {
                if bytes.len() < LZ4_MAGIC.len() + 1 {
                    return Ok(None);
                }
                if bytes[..4] != LZ4_MAGIC {
                    return Err(TunnelError::Framing("not an LZ4 frame".to_string()));
                }
                let flags = bytes[4];
                let mut len = 7;
                if flags & LZ4_FLAG_CONTENT_SIZE != 0 {
                    len += 8;
                }
                if flags & LZ4_FLAG_DICT_ID != 0 {
                    len += 4;
                }
                if bytes.len() < len {
                    return Ok(None);
                }
                self.flags = Some(flags);
                Ok(Some(len))
            }
            Some(flags) => {
                if bytes.len() < 4 {
                    return Ok(None);
                }
                let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let size = (word & 0x7FFF_FFFF) as usize;
                if size > LZ4_MAX_BLOCK {
                    return Err(TunnelError::Framing(format!("LZ4 block of {} bytes", size)));
                }
                let len = match size {
                    0 if flags & LZ4_FLAG_CONTENT_CHECKSUM != 0 => 8,
                    0 => 4,
                    _ if flags & LZ4_FLAG_BLOCK_CHECKSUM != 0 => 8 + size,
                    _ => 4 + size,
                };
                if bytes.len() < len {
                    return Ok(None);
                }
                if size == 0 {
                    self.flags = None;
                }
                Ok(Some(len))
            }
        }
    }

    fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(input);
        let mut ready = 0;
        while let Some(len) = self.unit_len(ready)? {
            ready += len;
        }
        self.decoder.get_mut().push(&self.pending[..ready]);
        self.pending.drain(..ready);

        let mut out = Vec::new();
        let mut scratch = [0u8; SCRATCH_LEN];
        loop {
            match self.decoder.read(&mut scratch) {
                Ok(0) => return Ok(out),
                Ok(n) => out.extend_from_slice(&scratch[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::UnexpectedEof
                        && self.decoder.get_ref().is_empty() =>
                {
                    return Ok(out)
                }
                Err(e) => return Err(codec_error("LZ4 decompression", e)),
            }
        }
    }
}

fn zstd_decompress(decoder: &mut ZstdDecoder<'static>, input: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 3);
    let mut scratch = [0u8; SCRATCH_LEN];
    let mut source = InBuffer::around(input);
    loop {
        let written = {
            let mut sink = OutBuffer::around(&mut scratch[..]);
            decoder.run(&mut source, &mut sink)?;
            sink.pos()
        };
        out.extend_from_slice(&scratch[..written]);
        // a partly filled sink means the decoder holds nothing more
        if source.pos() == input.len() && written < SCRATCH_LEN {
            return Ok(out);
        }
    }
}

enum Inflater {
    Lz4(Box<Lz4Inflater>),
    Zstd(ZstdDecoder<'static>),
}

/// Inbound filter
pub struct Decompressor {
    mode: CompressionMode,
    inflater: Option<Inflater>,
}

impl Decompressor {
    /// Build a filter for `mode`, `None` when compression is off
    pub fn for_mode(mode: CompressionMode) -> Option<Self> {
        (mode != CompressionMode::None).then(|| Decompressor {
            mode,
            inflater: None,
        })
    }

    /// Decode the next piece of the stream
    ///
    /// Bytes that end mid-block are kept until the rest arrives.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let inflater = match self.inflater.take() {
            Some(inflater) => inflater,
            None => match self.mode {
                CompressionMode::Heavy => Inflater::Zstd(
                    ZstdDecoder::new().map_err(|e| codec_error("zstd setup", e))?,
                ),
                _ => Inflater::Lz4(Box::new(Lz4Inflater::new())),
            },
        };
        match self.inflater.insert(inflater) {
            Inflater::Lz4(inflater) => inflater.decompress(input),
            Inflater::Zstd(decoder) => {
                zstd_decompress(decoder, input).map_err(|e| codec_error("zstd decompression", e))
            }
        }
    }
}
