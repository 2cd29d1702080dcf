//! ELIC Bitstream Layout
//!
//! A compressed image is an ordered list of `2k + 1` byte strings:
//!
//! ```text
//! [anchor_0, non_anchor_0, anchor_1, non_anchor_1, ..., anchor_{k-1}, non_anchor_{k-1}, side]
//! ```
//!
//! plus the spatial shape of the side-information grid, which the decoder
//! needs before anything else can be read.
//!
//! [`BitstreamRecord`] also has a byte serialization:
//!
//! ```text
//! +---------------------------+
//! | magic "ELIC"        (4B)  |
//! | version             (1B)  |
//! | reserved            (1B)  |
//! | string count        (2B)  |
//! | batch               (4B)  |
//! | side height         (4B)  |
//! | side width          (4B)  |
//! +---------------------------+
//! | len (4B) | string bytes   |  x count
//! +---------------------------+
//! ```
//!
//! All integers are little endian.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let strings = assemble(&slices, &side);
//! let record = BitstreamRecord::new(strings, (4, 4), 1);
//! let bytes = record.to_bytes()?;
//!
//! let record = BitstreamRecord::from_bytes(&bytes)?;
//! let (slices, side) = record.disassemble(num_slices)?;
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, ErrorKind, Read, Write};

use super::error::ElicError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Magic bytes of a serialized record
pub const MAGIC: &[u8; 4] = b"ELIC";

/// Current record version
pub const VERSION: u8 = 1;

/// Size of the fixed record header in bytes
pub const HEADER_SIZE: usize = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────────

/// The two strings of one slice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceStrings {
    /// Anchor pass string
    pub anchor: Vec<u8>,
    /// Non-anchor pass string
    pub non_anchor: Vec<u8>,
}

impl SliceStrings {
    /// Pair two pass strings
    pub fn new(anchor: Vec<u8>, non_anchor: Vec<u8>) -> Self {
        SliceStrings { anchor, non_anchor }
    }

    /// Combined length of both strings
    pub fn len(&self) -> usize {
        self.anchor.len() + self.non_anchor.len()
    }

    /// True when both strings are empty
    pub fn is_empty(&self) -> bool {
        self.anchor.is_empty() && self.non_anchor.is_empty()
    }
}

/// Flatten slice pairs and the side-information string into `2k + 1` strings
pub fn assemble(slices: &[SliceStrings], side: &[u8]) -> Vec<Vec<u8>> {
    let mut strings = Vec::with_capacity(2 * slices.len() + 1);
    for pair in slices {
        strings.push(pair.anchor.clone());
        strings.push(pair.non_anchor.clone());
    }
    strings.push(side.to_vec());
    strings
}

/// Split `2k + 1` strings back into `k` slice pairs and the side string
pub fn disassemble(
    strings: &[Vec<u8>],
    num_slices: usize,
) -> Result<(Vec<SliceStrings>, Vec<u8>), ElicError> {
    if strings.len() != 2 * num_slices + 1 {
        return Err(ElicError::framing(num_slices, strings.len()));
    }

    let (pairs, side) = strings.split_at(2 * num_slices);
    let slices = pairs
        .chunks_exact(2)
        .map(|pair| SliceStrings::new(pair[0].clone(), pair[1].clone()))
        .collect();
    Ok((slices, side[0].clone()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a decoder needs to reconstruct one batch of images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitstreamRecord {
    /// `2k + 1` strings
    pub strings: Vec<Vec<u8>>,
    /// Side-information spatial shape `(H, W)`
    pub shape: (usize, usize),
    /// Batch size
    pub batch: usize,
}

impl BitstreamRecord {
    /// Create a record from an assembled string list
    pub fn new(strings: Vec<Vec<u8>>, shape: (usize, usize), batch: usize) -> Self {
        BitstreamRecord {
            strings,
            shape,
            batch,
        }
    }

    /// Create a record from slice pairs and the side string
    pub fn from_parts(
        slices: &[SliceStrings],
        side: &[u8],
        shape: (usize, usize),
        batch: usize,
    ) -> Self {
        Self::new(assemble(slices, side), shape, batch)
    }

    /// Split the strings for a decoder configured with `num_slices` slices
    pub fn disassemble(&self, num_slices: usize) -> Result<(Vec<SliceStrings>, Vec<u8>), ElicError> {
        disassemble(&self.strings, num_slices)
    }

    /// Total string bytes, without framing
    pub fn payload_len(&self) -> usize {
        self.strings.iter().map(Vec::len).sum()
    }

    /// Size of [`to_bytes`](Self::to_bytes) output
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + 4 * self.strings.len() + self.payload_len()
    }

    /// Bits per pixel for images of `pixels` pixels each
    pub fn bpp(&self, pixels: usize) -> f64 {
        if pixels == 0 || self.batch == 0 {
            return 0.0;
        }
        (self.payload_len() * 8) as f64 / (pixels * self.batch) as f64
    }

    /// Serialize into `writer`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ElicError> {
        let count = u16::try_from(self.strings.len())
            .map_err(|_| ElicError::invalid_header(format!("{} strings", self.strings.len())))?;
        let batch = header_u32("batch", self.batch)?;
        let height = header_u32("side height", self.shape.0)?;
        let width = header_u32("side width", self.shape.1)?;

        writer.write_all(MAGIC)?;
        writer.write_u8(VERSION)?;
        writer.write_u8(0)?;
        writer.write_u16::<LittleEndian>(count)?;
        writer.write_u32::<LittleEndian>(batch)?;
        writer.write_u32::<LittleEndian>(height)?;
        writer.write_u32::<LittleEndian>(width)?;

        for string in &self.strings {
            writer.write_u32::<LittleEndian>(header_u32("string length", string.len())?)?;
            writer.write_all(string)?;
        }
        Ok(())
    }

    /// Deserialize from `reader`
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ElicError> {
        let mut reader = RecordReader::new(reader);

        let magic = reader.read_bytes(MAGIC.len(), "magic")?;
        if magic != MAGIC {
            return Err(ElicError::invalid_header(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                MAGIC, magic
            )));
        }

        let version = reader.read_u8("version")?;
        if version != VERSION {
            return Err(ElicError::UnsupportedBitstreamVersion {
                version,
                min_supported: VERSION,
                max_supported: VERSION,
            });
        }
        let reserved = reader.read_u8("reserved")?;
        if reserved != 0 {
            return Err(ElicError::invalid_header(format!(
                "reserved byte is {:#04x}",
                reserved
            )));
        }

        let count = reader.read_u16("string count")? as usize;
        let batch = reader.read_u32("batch")? as usize;
        let height = reader.read_u32("side height")? as usize;
        let width = reader.read_u32("side width")? as usize;

        let mut strings = Vec::with_capacity(count);
        for i in 0..count {
            let len = reader.read_u32("string length")? as usize;
            strings.push(reader.read_bytes(len, &format!("string {}", i))?);
        }

        Ok(BitstreamRecord::new(strings, (height, width), batch))
    }

    /// Serialize into a byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>, ElicError> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Deserialize a byte slice, rejecting trailing data
    pub fn from_bytes(data: &[u8]) -> Result<Self, ElicError> {
        let mut cursor = Cursor::new(data);
        let record = Self::read_from(&mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != data.len() {
            return Err(ElicError::corrupted(
                consumed,
                format!("{} trailing bytes", data.len() - consumed),
            ));
        }
        Ok(record)
    }
}

fn header_u32(field: &str, value: usize) -> Result<u32, ElicError> {
    u32::try_from(value)
        .map_err(|_| ElicError::invalid_header(format!("{} {} does not fit in 32 bits", field, value)))
}

/// Reader that tracks its byte offset for corruption reports
struct RecordReader<'r, R: Read> {
    inner: &'r mut R,
    offset: usize,
}

impl<'r, R: Read> RecordReader<'r, R> {
    fn new(inner: &'r mut R) -> Self {
        RecordReader { inner, offset: 0 }
    }

    fn truncated(&self, what: &str, err: std::io::Error) -> ElicError {
        if err.kind() == ErrorKind::UnexpectedEof {
            ElicError::corrupted(self.offset, format!("truncated {}", what))
        } else {
            err.into()
        }
    }

    fn read_u8(&mut self, what: &str) -> Result<u8, ElicError> {
        let v = self.inner.read_u8().map_err(|e| self.truncated(what, e))?;
        self.offset += 1;
        Ok(v)
    }

    fn read_u16(&mut self, what: &str) -> Result<u16, ElicError> {
        let v = self
            .inner
            .read_u16::<LittleEndian>()
            .map_err(|e| self.truncated(what, e))?;
        self.offset += 2;
        Ok(v)
    }

    fn read_u32(&mut self, what: &str) -> Result<u32, ElicError> {
        let v = self
            .inner
            .read_u32::<LittleEndian>()
            .map_err(|e| self.truncated(what, e))?;
        self.offset += 4;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize, what: &str) -> Result<Vec<u8>, ElicError> {
        let mut buf = Vec::new();
        let read = (&mut *self.inner).take(len as u64).read_to_end(&mut buf);
        read.map_err(|e| self.truncated(what, e))?;
        if buf.len() != len {
            return Err(ElicError::corrupted(
                self.offset + buf.len(),
                format!("truncated {}: expected {} bytes, got {}", what, len, buf.len()),
            ));
        }
        self.offset += len;
        Ok(buf)
    }
}
