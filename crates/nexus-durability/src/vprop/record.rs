//! Virtual property file records
//!
//! ```text
//! header (4096 bytes)
//!   [zero:8][graph id:2][commit:1][bytes:1][count:1][reserved:3][zero...]
//! record
//!   [DELIM:2][vertex:2][allotted:1][key len:1][value len:1][type|attr:1]
//!   [key words][value words][padding words]
//! tail
//!   [DELIM:2]
//! ```

use crate::codec::{WORD_SIZE, Word, WordReader, WordWriter};
use crate::graph::GraphId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the file header
pub const HEADER_BYTES: u64 = 4096;

/// Size of the record/tail delimiter
pub const DELIM_BYTES: u64 = 16;

/// Size of a record head including its leading delimiter
pub const RECORD_HEAD_BYTES: u64 = 64;

/// Record and tail delimiter
pub const VPROP_DELIM: [Word; 2] = [0x4f52_5021_5847_5621, 0x214d_494c_4544_2150];

/// Value type tag for string values
pub const VALUE_TYPE_STRING: u32 = 0x08;

const HEADER_WORDS: usize = HEADER_BYTES as usize / WORD_SIZE;
const HEADER_USED_WORDS: usize = 16;

/// Slack words appended after a value of `value_words` words
pub fn padding_words(value_words: u64) -> u64 {
    if value_words < 16 {
        2
    } else if value_words < 512 {
        value_words >> 3
    } else {
        64
    }
}

/// Byte offset of a record in the virtual property file
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef(u64);

impl RecordRef {
    /// Validate and wrap a file offset
    pub fn new(offset: u64) -> Result<Self> {
        if offset < HEADER_BYTES || offset % WORD_SIZE as u64 != 0 {
            return Err(Error::corruption(format!(
                "Invalid virtual property offset {}",
                offset
            )));
        }
        Ok(Self(offset))
    }

    /// File offset
    pub fn offset(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordRef({})", self.0)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Persistent header of the virtual property file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpropHeader {
    /// Owning graph
    pub graph: GraphId,
    /// Commit watermark (byte offset)
    pub commit: u64,
    /// Value bytes written, less erased
    pub bytes: u64,
    /// Records written, less erased
    pub count: u64,
}

impl VpropHeader {
    /// Header for an empty file
    pub fn new(graph: GraphId) -> Self {
        Self {
            graph,
            commit: HEADER_BYTES,
            bytes: 0,
            count: 0,
        }
    }

    /// Encode to exactly [`HEADER_BYTES`] bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WordWriter::new(Vec::with_capacity(HEADER_BYTES as usize));
        w.write_zeros(8)?;
        w.write_u128(self.graph.0)?;
        w.write_words(&[self.commit, self.bytes, self.count])?;
        w.write_zeros(HEADER_WORDS - 8 - 2 - 3)?;
        Ok(w.into_inner())
    }

    /// Decode from a header buffer
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_USED_WORDS * WORD_SIZE {
            return Err(Error::corruption("Virtual property header too short"));
        }
        let mut r = WordReader::new(buf);
        r.skip_words(8)?;
        let graph = GraphId(r.read_u128()?);
        let commit = r.read_word()?;
        let bytes = r.read_word()?;
        let count = r.read_word()?;
        if commit < HEADER_BYTES {
            return Err(Error::corruption(format!(
                "Virtual property commit watermark {} inside header",
                commit
            )));
        }
        Ok(Self {
            graph,
            commit,
            bytes,
            count,
        })
    }
}

/// Fixed-size head of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHead {
    /// Owning vertex id
    pub vertex: u128,
    /// Words allotted to key, value and padding
    pub allotted: u64,
    /// Key length in bytes
    pub key_len: u64,
    /// Value length in bytes
    pub value_len: u64,
    /// Value type tag
    pub value_type: u32,
    /// Value attributes
    pub attr: u32,
}

impl RecordHead {
    /// True once the record's identifying fields are zeroed
    pub fn is_erased(&self) -> bool {
        self.vertex == 0 && self.value_type == 0
    }

    /// Words needed by the current key and value
    pub fn payload_words(&self) -> u64 {
        (self.key_len.div_ceil(WORD_SIZE as u64)) + (self.value_len.div_ceil(WORD_SIZE as u64))
    }

    /// Same allotment with identifying fields zeroed
    pub fn erased(&self) -> Self {
        Self {
            vertex: 0,
            allotted: self.allotted,
            key_len: 0,
            value_len: 0,
            value_type: 0,
            attr: 0,
        }
    }

    /// Encode including the leading delimiter
    pub fn write_to<W: std::io::Write>(&self, w: &mut WordWriter<W>) -> Result<u64> {
        let mut n = w.write_words(&VPROP_DELIM)?;
        n += w.write_u128(self.vertex)?;
        n += w.write_words(&[
            self.allotted,
            self.key_len,
            self.value_len,
            self.value_type as u64 | ((self.attr as u64) << 32),
        ])?;
        Ok(n)
    }

    /// Decode, validating the leading delimiter
    pub fn decode(buf: &[u8], at: u64) -> Result<Self> {
        let mut r = WordReader::new(buf);
        let lo = r.read_word()?;
        let hi = r.read_word()?;
        if [lo, hi] != VPROP_DELIM {
            return Err(Error::corruption(format!(
                "Virtual property delimiter missing at offset {}",
                at
            )));
        }
        let vertex = r.read_u128()?;
        let allotted = r.read_word()?;
        let key_len = r.read_word()?;
        let value_len = r.read_word()?;
        let tag = r.read_word()?;
        Ok(Self {
            vertex,
            allotted,
            key_len,
            value_len,
            value_type: tag as u32,
            attr: (tag >> 32) as u32,
        })
    }
}
