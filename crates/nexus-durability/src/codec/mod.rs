//! Binary framing codec
//!
//! Everything persisted by this crate is a stream of little-endian 64-bit
//! words. The codec provides the framing primitives shared by the graph state
//! superblock, collaborators and tests:
//!
//! ```text
//! string        [len:1][words:1][payload + NUL, zero padded:words]
//! digested      [digest:2][string]
//! key/value     [KEY_FOLLOWS][string][VALUE_FOLLOWS][string][END_KEY_VALUE]
//! section       [BEGIN_SECTION:4][digested name] ... [END_SECTION:4]
//! file          [BEGIN_FILE:8][section(file name)] ... [END_FILE:8]
//! ```
//!
//! Writers return the number of words written; readers count the words they
//! consume. A content mismatch is always [`Error::Corruption`].

pub mod delimiter;

use crate::{Error, Result};
use std::fmt;
use std::io::{Read, Write};

pub use delimiter::{
    BEGIN_FILE, BEGIN_SECTION, END_FILE, END_KEY_VALUE, END_SECTION, KEY_FOLLOWS, VALUE_FOLLOWS,
};

/// Unit of all persisted data
pub type Word = u64;

/// Bytes per word
pub const WORD_SIZE: usize = 8;

/// Upper bound on a single framed string
pub const MAX_STRING_BYTES: u64 = 1 << 30;

/// Number of words needed to hold `bytes` bytes
pub fn words_for(bytes: usize) -> usize {
    bytes.div_ceil(WORD_SIZE)
}

/// 128-bit content digest used by digested strings
pub fn digest128(bytes: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128(bytes)
}

/// Word-oriented writer over any byte sink
pub struct WordWriter<W: Write> {
    inner: W,
    words: u64,
}

impl<W: Write> WordWriter<W> {
    /// Wrap a byte sink
    pub fn new(inner: W) -> Self {
        Self { inner, words: 0 }
    }

    /// Total words written through this writer
    pub fn words_written(&self) -> u64 {
        self.words
    }

    /// Borrow the underlying sink
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the underlying sink
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap the underlying sink
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Flush the underlying sink
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Write a single word
    pub fn write_word(&mut self, word: Word) -> Result<u64> {
        self.inner.write_all(&word.to_le_bytes())?;
        self.words += 1;
        Ok(1)
    }

    /// Write a slice of words
    pub fn write_words(&mut self, words: &[Word]) -> Result<u64> {
        let mut buf = Vec::with_capacity(words.len() * WORD_SIZE);
        for w in words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        self.inner.write_all(&buf)?;
        self.words += words.len() as u64;
        Ok(words.len() as u64)
    }

    /// Write a 128-bit value as two words, low word first
    pub fn write_u128(&mut self, value: u128) -> Result<u64> {
        self.write_words(&[value as u64, (value >> 64) as u64])
    }

    /// Write `nwords` zero words
    pub fn write_zeros(&mut self, nwords: usize) -> Result<u64> {
        const ZEROS: [u8; 4096] = [0u8; 4096];
        let mut remaining = nwords * WORD_SIZE;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len());
            self.inner.write_all(&ZEROS[..n])?;
            remaining -= n;
        }
        self.words += nwords as u64;
        Ok(nwords as u64)
    }

    /// Write raw bytes zero padded to exactly `nwords` words
    pub fn write_padded(&mut self, bytes: &[u8], nwords: usize) -> Result<u64> {
        let total = nwords * WORD_SIZE;
        if bytes.len() > total {
            return Err(Error::corruption(format!(
                "{} bytes do not fit in {} words",
                bytes.len(),
                nwords
            )));
        }
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(bytes);
        buf.resize(total, 0);
        self.inner.write_all(&buf)?;
        self.words += nwords as u64;
        Ok(nwords as u64)
    }

    /// Write a length-prefixed, NUL-terminated string
    pub fn write_string(&mut self, s: &str) -> Result<u64> {
        let bytes = s.as_bytes();
        let nwords = words_for(bytes.len() + 1);
        let mut n = self.write_word(bytes.len() as u64)?;
        n += self.write_word(nwords as u64)?;
        n += self.write_padded(bytes, nwords)?;
        Ok(n)
    }

    /// Write a string prefixed by its 128-bit digest
    pub fn write_digested_string(&mut self, s: &str) -> Result<u64> {
        let n = self.write_u128(digest128(s.as_bytes()))?;
        Ok(n + self.write_string(s)?)
    }

    /// Write a key/value pair wrapped in sentinels
    pub fn write_key_value(&mut self, key: &str, value: &str) -> Result<u64> {
        let mut n = self.write_word(KEY_FOLLOWS)?;
        n += self.write_string(key)?;
        n += self.write_word(VALUE_FOLLOWS)?;
        n += self.write_string(value)?;
        n += self.write_word(END_KEY_VALUE)?;
        Ok(n)
    }

    /// Open a file; the file name is recorded in its own section
    pub fn write_begin_file(&mut self, name: &str) -> Result<u64> {
        let mut n = self.write_words(&BEGIN_FILE)?;
        n += self.write_begin_section(name)?;
        n += self.write_end_section()?;
        Ok(n)
    }

    /// Close a file
    pub fn write_end_file(&mut self) -> Result<u64> {
        self.write_words(&END_FILE)
    }

    /// Open a named section
    pub fn write_begin_section(&mut self, name: &str) -> Result<u64> {
        let n = self.write_words(&BEGIN_SECTION)?;
        Ok(n + self.write_digested_string(name)?)
    }

    /// Open a section whose name is built from format arguments
    pub fn write_begin_section_fmt(&mut self, name: fmt::Arguments<'_>) -> Result<u64> {
        self.write_begin_section(&name.to_string())
    }

    /// Close a section
    pub fn write_end_section(&mut self) -> Result<u64> {
        self.write_words(&END_SECTION)
    }
}

/// Word-oriented reader over any byte source
pub struct WordReader<R: Read> {
    inner: R,
    words: u64,
}

impl<R: Read> WordReader<R> {
    /// Wrap a byte source
    pub fn new(inner: R) -> Self {
        Self { inner, words: 0 }
    }

    /// Total words consumed through this reader
    pub fn words_read(&self) -> u64 {
        self.words
    }

    /// Unwrap the underlying source
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read a single word
    pub fn read_word(&mut self) -> Result<Word> {
        let mut buf = [0u8; WORD_SIZE];
        self.inner.read_exact(&mut buf)?;
        self.words += 1;
        Ok(Word::from_le_bytes(buf))
    }

    /// Fill `out` with words
    pub fn read_words(&mut self, out: &mut [Word]) -> Result<u64> {
        for slot in out.iter_mut() {
            *slot = self.read_word()?;
        }
        Ok(out.len() as u64)
    }

    /// Read a 128-bit value stored low word first
    pub fn read_u128(&mut self) -> Result<u128> {
        let lo = self.read_word()? as u128;
        let hi = self.read_word()? as u128;
        Ok(lo | (hi << 64))
    }

    /// Read `nwords` words of raw bytes
    pub fn read_padded(&mut self, nwords: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; nwords * WORD_SIZE];
        self.inner.read_exact(&mut buf)?;
        self.words += nwords as u64;
        Ok(buf)
    }

    /// Discard `nwords` words
    pub fn skip_words(&mut self, nwords: u64) -> Result<u64> {
        let bytes = nwords * WORD_SIZE as u64;
        let copied = std::io::copy(&mut (&mut self.inner).take(bytes), &mut std::io::sink())?;
        if copied != bytes {
            return Err(Error::corruption(format!(
                "Unexpected end of data skipping {} words",
                nwords
            )));
        }
        self.words += nwords;
        Ok(nwords)
    }

    /// Consume words that must equal `expected`
    pub fn expect_words(&mut self, expected: &[Word], what: &str) -> Result<u64> {
        for (i, want) in expected.iter().enumerate() {
            let got = self.read_word()?;
            if got != *want {
                return Err(Error::corruption(format!(
                    "{} mismatch at word {}: expected {:016x}, got {:016x}",
                    what, i, want, got
                )));
            }
        }
        Ok(expected.len() as u64)
    }

    /// Read a length-prefixed, NUL-terminated string
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_word()?;
        let nwords = self.read_word()?;
        if len >= MAX_STRING_BYTES {
            return Err(Error::corruption(format!("String length {} out of range", len)));
        }
        if nwords != words_for(len as usize + 1) as u64 {
            return Err(Error::corruption(format!(
                "String length {} inconsistent with {} words",
                len, nwords
            )));
        }
        let mut bytes = self.read_padded(nwords as usize)?;
        if bytes[len as usize] != 0 {
            return Err(Error::corruption("String is not NUL-terminated"));
        }
        bytes.truncate(len as usize);
        String::from_utf8(bytes).map_err(|e| Error::corruption(format!("Invalid UTF-8: {}", e)))
    }

    /// Read a string and require it to equal `expected`
    pub fn expect_string(&mut self, expected: &str) -> Result<u64> {
        let start = self.words;
        let got = self.read_string()?;
        if got != expected {
            return Err(Error::corruption(format!(
                "Expected '{}', got '{}'",
                expected, got
            )));
        }
        Ok(self.words - start)
    }

    /// Read a digested string and verify its digest
    pub fn read_digested_string(&mut self) -> Result<String> {
        let stored = self.read_u128()?;
        let s = self.read_string()?;
        let computed = digest128(s.as_bytes());
        if stored != computed {
            return Err(Error::corruption(format!(
                "Digest mismatch for '{}': stored {:032x}, computed {:032x}",
                s, stored, computed
            )));
        }
        Ok(s)
    }

    /// Read a digested string and require it to equal `expected`
    pub fn expect_digested_string(&mut self, expected: &str) -> Result<u64> {
        let start = self.words;
        let got = self.read_digested_string()?;
        if got != expected {
            return Err(Error::corruption(format!(
                "Expected '{}', got '{}'",
                expected, got
            )));
        }
        Ok(self.words - start)
    }

    /// Read a sentinel-wrapped key/value pair
    pub fn read_key_value(&mut self) -> Result<(String, String)> {
        self.expect_words(&[KEY_FOLLOWS], "key sentinel")?;
        let key = self.read_string()?;
        self.expect_words(&[VALUE_FOLLOWS], "value sentinel")?;
        let value = self.read_string()?;
        self.expect_words(&[END_KEY_VALUE], "key/value terminator")?;
        Ok((key, value))
    }

    /// Consume a file header
    ///
    /// A different file name is tolerated with a warning: files are allowed to
    /// move between directories.
    pub fn expect_begin_file(&mut self, name: &str) -> Result<u64> {
        let start = self.words;
        self.expect_words(&BEGIN_FILE, "begin file delimiter")?;
        let found = self.read_begin_section()?;
        if found != name {
            tracing::warn!("File name mismatch: expected '{}', found '{}' (file path changed?)", name, found);
        }
        self.expect_end_section()?;
        Ok(self.words - start)
    }

    /// Consume a file trailer
    pub fn expect_end_file(&mut self) -> Result<u64> {
        self.expect_words(&END_FILE, "end file delimiter")
    }

    /// Consume a section header and return its name
    pub fn read_begin_section(&mut self) -> Result<String> {
        self.expect_words(&BEGIN_SECTION, "begin section delimiter")?;
        self.read_digested_string()
    }

    /// Consume a section header that must carry `name`
    pub fn expect_begin_section(&mut self, name: &str) -> Result<u64> {
        let start = self.words;
        self.expect_words(&BEGIN_SECTION, "begin section delimiter")?;
        self.expect_digested_string(name)?;
        Ok(self.words - start)
    }

    /// Consume a section trailer
    pub fn expect_end_section(&mut self) -> Result<u64> {
        self.expect_words(&END_SECTION, "end section delimiter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use proptest::prelude::*;

    fn reader(buf: &[u8]) -> WordReader<&[u8]> {
        WordReader::new(buf)
    }

    #[test]
    fn test_string_layout() {
        let mut w = WordWriter::new(Vec::new());
        // "abcdefgh" needs 9 bytes with NUL -> 2 words
        assert_eq!(w.write_string("abcdefgh").unwrap(), 4);
        let buf = w.into_inner();
        assert_eq!(buf.len(), 32);
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 8);
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 2);
        assert_eq!(&buf[16..24], b"abcdefgh");
        assert!(buf[24..].iter().all(|b| *b == 0));

        let mut r = reader(&buf);
        assert_eq!(r.read_string().unwrap(), "abcdefgh");
        assert_eq!(r.words_read(), 4);
    }

    #[test]
    fn test_empty_string() {
        let mut w = WordWriter::new(Vec::new());
        assert_eq!(w.write_string("").unwrap(), 3);
        let buf = w.into_inner();
        assert_eq!(reader(&buf).read_string().unwrap(), "");
    }

    #[test]
    fn test_expect_string_mismatch() {
        let mut w = WordWriter::new(Vec::new());
        w.write_string("vertex").unwrap();
        let buf = w.into_inner();
        let err = reader(&buf).expect_string("vertices").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_digest_mismatch_is_corruption() {
        let mut w = WordWriter::new(Vec::new());
        w.write_digested_string("relationships").unwrap();
        let mut buf = w.into_inner();
        // Flip a payload byte: string still decodes, digest no longer matches
        buf[32] ^= 0x01;
        let err = reader(&buf).read_digested_string().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert!(err.to_string().contains("Digest mismatch"));
    }

    #[test]
    fn test_key_value() {
        let mut w = WordWriter::new(Vec::new());
        w.write_key_value("name", "alice").unwrap();
        let buf = w.into_inner();
        let (k, v) = reader(&buf).read_key_value().unwrap();
        assert_eq!(k, "name");
        assert_eq!(v, "alice");
    }

    #[test]
    fn test_key_value_missing_sentinel() {
        let mut w = WordWriter::new(Vec::new());
        w.write_string("name").unwrap();
        let buf = w.into_inner();
        let err = reader(&buf).read_key_value().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_file_and_sections() {
        let mut w = WordWriter::new(Vec::new());
        let mut n = w.write_begin_file("g.graphstate.dat").unwrap();
        n += w.write_begin_section_fmt(format_args!("TYPE[{}]", 7)).unwrap();
        n += w.write_word(42).unwrap();
        n += w.write_end_section().unwrap();
        n += w.write_end_file().unwrap();
        assert_eq!(n, w.words_written());
        let buf = w.into_inner();

        let mut r = reader(&buf);
        r.expect_begin_file("g.graphstate.dat").unwrap();
        r.expect_begin_section("TYPE[7]").unwrap();
        assert_eq!(r.read_word().unwrap(), 42);
        r.expect_end_section().unwrap();
        r.expect_end_file().unwrap();
        assert_eq!(r.words_read(), n);
    }

    #[test]
    fn test_begin_file_name_change_is_tolerated() {
        let mut w = WordWriter::new(Vec::new());
        w.write_begin_file("old/place.dat").unwrap();
        let buf = w.into_inner();
        assert!(reader(&buf).expect_begin_file("new/place.dat").is_ok());
    }

    #[test]
    fn test_wrong_section_name() {
        let mut w = WordWriter::new(Vec::new());
        w.write_begin_section("GRAPH").unwrap();
        let buf = w.into_inner();
        let err = reader(&buf).expect_begin_section("TIME").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_truncated_input_is_io_error() {
        let mut w = WordWriter::new(Vec::new());
        w.write_string("truncated payload").unwrap();
        let buf = w.into_inner();
        let err = reader(&buf[..20]).read_string().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Filesystem);
    }

    #[test]
    fn test_skip_words() {
        let mut w = WordWriter::new(Vec::new());
        w.write_zeros(10).unwrap();
        w.write_word(7).unwrap();
        let buf = w.into_inner();
        let mut r = reader(&buf);
        r.skip_words(10).unwrap();
        assert_eq!(r.read_word().unwrap(), 7);
        assert!(r.skip_words(1).is_err());
    }

    fn framed_section() -> Vec<u8> {
        let mut w = WordWriter::new(Vec::new());
        w.write_begin_section("VERTEXTYPE").unwrap();
        w.write_word(3).unwrap();
        w.write_end_section().unwrap();
        w.into_inner()
    }

    fn framed_file() -> Vec<u8> {
        let mut w = WordWriter::new(Vec::new());
        w.write_words(&BEGIN_FILE).unwrap();
        w.write_word(1).unwrap();
        w.write_end_file().unwrap();
        w.into_inner()
    }

    proptest! {
        #[test]
        fn prop_section_delimiter_bit_flip_detected(bit in 0usize..(4 * 64), trailer in any::<bool>()) {
            let mut buf = framed_section();
            let section_len = buf.len();
            // Begin delimiter occupies the first 4 words, end delimiter the last 4
            let base = if trailer { section_len - 32 } else { 0 };
            buf[base + bit / 8] ^= 1 << (bit % 8);

            let mut r = WordReader::new(buf.as_slice());
            let result = r
                .expect_begin_section("VERTEXTYPE")
                .and_then(|_| r.read_word())
                .and_then(|_| r.expect_end_section());
            let err = result.unwrap_err();
            prop_assert_eq!(err.kind(), ErrorKind::Corruption);
        }

        #[test]
        fn prop_file_delimiter_bit_flip_detected(bit in 0usize..(8 * 64), trailer in any::<bool>()) {
            let mut buf = framed_file();
            let base = if trailer { buf.len() - 64 } else { 0 };
            buf[base + bit / 8] ^= 1 << (bit % 8);

            let mut r = WordReader::new(buf.as_slice());
            let result = r
                .expect_words(&BEGIN_FILE, "begin file delimiter")
                .and_then(|_| r.read_word())
                .and_then(|_| r.expect_end_file());
            prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::Corruption);
        }

        #[test]
        fn prop_string_words_match_layout(s in "[a-zA-Z0-9 ]{0,200}") {
            let mut w = WordWriter::new(Vec::new());
            let n = w.write_string(&s).unwrap();
            prop_assert_eq!(n as usize, 2 + words_for(s.len() + 1));
            let buf = w.into_inner();
            prop_assert_eq!(reader(&buf).read_string().unwrap(), s);
        }
    }
}
