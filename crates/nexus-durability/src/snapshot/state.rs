//! GraphState superblock
//!
//! Fixed-size (1 MiB) binary record written at the end of every snapshot:
//!
//! ```text
//! [BEGIN_FILE "<name>.graphstate.dat"]
//!   [GRAPH]          order size opcount n_ops name version flags tx_out tx_in
//!   [VERTEXTYPE]     n { hash enc order prefix[4] } * n
//!   [RELATIONSHIP]   n { hash enc size prefix[4] } * n
//!   [VERTEXPROPERTY] keys string_values properties strings
//!   [VECTOR]         dimensions vectors
//!   [TIME]           graph_t0 tic_t0 graph_up persist_t0 persist_t1 persist_n persist_t
//!   [zero padding]
//! [END_FILE]
//! ```

use super::paths;
use crate::codec::{END_FILE, WORD_SIZE, WordReader, WordWriter, words_for};
use crate::durability::{TxCounters, TxId, TxPoint};
use crate::error::IoResultExt;
use crate::graph::{
    Graph, GraphCounts, MAX_ENUMERATED, PREFIX_BYTES, RelationshipEntry, VertexTypeEntry,
    enum_prefix,
};
use crate::{Error, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Size of the binary superblock
pub const GRAPHSTATE_BYTES: usize = 1 << 20;

/// Version string recorded in the superblock
pub const GRAPHSTATE_VERSION: &str = concat!("nexus-durability/", env!("CARGO_PKG_VERSION"));

const PREFIX_WORDS: usize = PREFIX_BYTES / WORD_SIZE;

/// Graph identity and top-level counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSection {
    /// Vertices
    pub order: u64,
    /// Arcs
    pub size: u64,
    /// Operations applied since inception
    pub opcount: u64,
    /// Operations since the previous snapshot
    pub n_ops: u64,
    /// Graph name
    pub name: String,
    /// Writer version
    pub version: String,
    /// Readonly at the time of writing
    pub readonly: bool,
    /// Never attached to the output stream
    pub local_only: bool,
    /// Outbound transactions
    pub tx_out: TxCounters,
    /// Inbound transactions
    pub tx_in: TxCounters,
}

/// Property counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropertySection {
    /// Distinct keys
    pub keys: u64,
    /// Distinct string values
    pub string_values: u64,
    /// Properties
    pub properties: u64,
    /// Allocated strings
    pub strings: u64,
}

/// Vector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VectorSection {
    /// Dimensions
    pub dimensions: u64,
    /// Vectors
    pub vectors: u64,
}

/// Timing metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSection {
    /// Graph inception (Unix seconds)
    pub graph_t0: u64,
    /// Process start of the writer (Unix millis)
    pub tic_t0: u64,
    /// Uptime of the writer (seconds)
    pub graph_up: u64,
    /// Start of the last snapshot (Unix millis)
    pub persist_t0: u64,
    /// End of the last snapshot (Unix millis)
    pub persist_t1: u64,
    /// Snapshots taken
    pub persist_n: u64,
    /// Cumulative snapshot time (millis)
    pub persist_t: u64,
}

/// The superblock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphState {
    /// Identity and counters
    pub graph: GraphSection,
    /// Vertex type enumeration
    pub vertex_types: Vec<VertexTypeEntry>,
    /// Relationship enumeration
    pub relationships: Vec<RelationshipEntry>,
    /// Property counters
    pub properties: PropertySection,
    /// Vector counters
    pub vectors: VectorSection,
    /// Timing
    pub time: TimeSection,
}

impl GraphState {
    /// Describe the live graph as if it had never been persisted
    pub fn from_graph(graph: &Graph) -> Self {
        let counts = graph.counts();
        let enums = graph.enumerations();
        let ledger = graph.tx_ledger();
        Self {
            graph: GraphSection {
                order: counts.order,
                size: counts.size,
                opcount: graph.opcount(),
                n_ops: 0,
                name: graph.name().to_string(),
                version: GRAPHSTATE_VERSION.to_string(),
                readonly: graph.locks().is_readonly(),
                local_only: graph.is_local_only(),
                tx_out: ledger.outbound,
                tx_in: ledger.inbound,
            },
            vertex_types: enums.vertex_types,
            relationships: enums.relationships,
            properties: PropertySection {
                keys: counts.keys,
                string_values: counts.string_values,
                properties: counts.properties,
                strings: counts.strings,
            },
            vectors: VectorSection {
                dimensions: counts.dimensions,
                vectors: counts.vectors,
            },
            time: TimeSection {
                graph_t0: graph.inception(),
                tic_t0: graph.started_ms(),
                graph_up: graph.uptime().as_secs(),
                persist_t0: 0,
                persist_t1: 0,
                persist_n: 0,
                persist_t: 0,
            },
        }
    }

    /// Base counts recorded in this state
    pub fn counts(&self) -> GraphCounts {
        GraphCounts {
            order: self.graph.order,
            size: self.graph.size,
            properties: self.properties.properties,
            keys: self.properties.keys,
            string_values: self.properties.string_values,
            strings: self.properties.strings,
            vectors: self.vectors.vectors,
            dimensions: self.vectors.dimensions,
        }
    }

    /// Encode to exactly [`GRAPHSTATE_BYTES`] bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.vertex_types.len() > MAX_ENUMERATED || self.relationships.len() > MAX_ENUMERATED {
            return Err(Error::state(format!(
                "Enumeration tables exceed {} entries",
                MAX_ENUMERATED
            )));
        }
        let mut w = WordWriter::new(Vec::with_capacity(GRAPHSTATE_BYTES));
        w.write_begin_file(&paths::graphstate_file_name(&self.graph.name))?;
        self.write_graph(&mut w)?;
        self.write_vertex_types(&mut w)?;
        self.write_relationships(&mut w)?;

        w.write_begin_section("VERTEXPROPERTY")?;
        w.write_words(&[
            self.properties.keys,
            self.properties.string_values,
            self.properties.properties,
            self.properties.strings,
        ])?;
        w.write_end_section()?;

        w.write_begin_section("VECTOR")?;
        w.write_words(&[self.vectors.dimensions, self.vectors.vectors])?;
        w.write_end_section()?;

        let t = &self.time;
        w.write_begin_section("TIME")?;
        w.write_words(&[
            t.graph_t0,
            t.tic_t0,
            t.graph_up,
            t.persist_t0,
            t.persist_t1,
            t.persist_n,
            t.persist_t,
        ])?;
        w.write_end_section()?;

        let total_words = GRAPHSTATE_BYTES / WORD_SIZE;
        let used = w.words_written() as usize + END_FILE.len();
        if used > total_words {
            return Err(Error::state(format!(
                "GraphState for '{}' does not fit in {} bytes",
                self.graph.name, GRAPHSTATE_BYTES
            )));
        }
        w.write_zeros(total_words - used)?;
        w.write_end_file()?;
        Ok(w.into_inner())
    }

    fn write_graph(&self, w: &mut WordWriter<Vec<u8>>) -> Result<()> {
        let g = &self.graph;
        w.write_begin_section("GRAPH")?;
        w.write_words(&[g.order, g.size, g.opcount, g.n_ops])?;
        w.write_string(&g.name)?;
        w.write_string(&g.version)?;
        w.write_words(&[g.readonly as u64, g.local_only as u64])?;
        write_counters(w, &g.tx_out)?;
        write_counters(w, &g.tx_in)?;
        w.write_end_section()?;
        Ok(())
    }

    fn write_vertex_types(&self, w: &mut WordWriter<Vec<u8>>) -> Result<()> {
        w.write_begin_section("VERTEXTYPE")?;
        w.write_word(self.vertex_types.len() as u64)?;
        for entry in &self.vertex_types {
            w.write_words(&[entry.hash, entry.encoding as u64, entry.order])?;
            w.write_padded(enum_prefix(&entry.name).as_bytes(), PREFIX_WORDS)?;
        }
        w.write_end_section()?;
        Ok(())
    }

    fn write_relationships(&self, w: &mut WordWriter<Vec<u8>>) -> Result<()> {
        w.write_begin_section("RELATIONSHIP")?;
        w.write_word(self.relationships.len() as u64)?;
        for entry in &self.relationships {
            w.write_words(&[entry.hash, entry.encoding as u64, entry.size as u64])?;
            w.write_padded(enum_prefix(&entry.name).as_bytes(), PREFIX_WORDS)?;
        }
        w.write_end_section()?;
        Ok(())
    }

    /// Decode a superblock; the buffer must be exactly [`GRAPHSTATE_BYTES`]
    pub fn decode(buf: &[u8], name: &str) -> Result<Self> {
        if buf.len() != GRAPHSTATE_BYTES {
            return Err(Error::corruption(format!(
                "GraphState for '{}' is {} bytes, expected {}",
                name,
                buf.len(),
                GRAPHSTATE_BYTES
            )));
        }
        let mut r = WordReader::new(buf);
        r.expect_begin_file(&paths::graphstate_file_name(name))?;

        r.expect_begin_section("GRAPH")?;
        let order = r.read_word()?;
        let size = r.read_word()?;
        let opcount = r.read_word()?;
        let n_ops = r.read_word()?;
        let graph_name = r.read_string()?;
        let version = r.read_string()?;
        let readonly = r.read_word()? != 0;
        let local_only = r.read_word()? != 0;
        let tx_out = read_counters(&mut r)?;
        let tx_in = read_counters(&mut r)?;
        r.expect_end_section()?;

        r.expect_begin_section("VERTEXTYPE")?;
        let n = read_count(&mut r, "vertex type")?;
        let mut vertex_types = Vec::with_capacity(n);
        for _ in 0..n {
            let hash = r.read_word()?;
            let encoding = read_encoding(&mut r)?;
            let order = r.read_word()?;
            let name = read_prefix(&mut r)?;
            vertex_types.push(VertexTypeEntry {
                name,
                hash,
                encoding,
                order,
            });
        }
        r.expect_end_section()?;

        r.expect_begin_section("RELATIONSHIP")?;
        let n = read_count(&mut r, "relationship")?;
        let mut relationships = Vec::with_capacity(n);
        for _ in 0..n {
            let hash = r.read_word()?;
            let encoding = read_encoding(&mut r)?;
            let size = r.read_word()? as i64;
            let name = read_prefix(&mut r)?;
            relationships.push(RelationshipEntry {
                name,
                hash,
                encoding,
                size,
            });
        }
        r.expect_end_section()?;

        r.expect_begin_section("VERTEXPROPERTY")?;
        let properties = PropertySection {
            keys: r.read_word()?,
            string_values: r.read_word()?,
            properties: r.read_word()?,
            strings: r.read_word()?,
        };
        r.expect_end_section()?;

        r.expect_begin_section("VECTOR")?;
        let vectors = VectorSection {
            dimensions: r.read_word()?,
            vectors: r.read_word()?,
        };
        r.expect_end_section()?;

        r.expect_begin_section("TIME")?;
        let time = TimeSection {
            graph_t0: r.read_word()?,
            tic_t0: r.read_word()?,
            graph_up: r.read_word()?,
            persist_t0: r.read_word()?,
            persist_t1: r.read_word()?,
            persist_n: r.read_word()?,
            persist_t: r.read_word()?,
        };
        r.expect_end_section()?;

        let total_words = (GRAPHSTATE_BYTES / WORD_SIZE) as u64;
        let padding = total_words - END_FILE.len() as u64 - r.words_read();
        r.skip_words(padding)?;
        r.expect_end_file()?;

        Ok(Self {
            graph: GraphSection {
                order,
                size,
                opcount,
                n_ops,
                name: graph_name,
                version,
                readonly,
                local_only,
                tx_out,
                tx_in,
            },
            vertex_types,
            relationships,
            properties,
            vectors,
            time,
        })
    }

    /// Write the binary superblock crash-safely; returns words written
    pub fn write_to_dir(&self, dir: &Path) -> Result<u64> {
        let buf = self.encode()?;
        let path = paths::graphstate_path(dir, &self.graph.name);
        let tmp = path.with_extension("dat.tmp");
        {
            let mut file = File::create(&tmp).fs_context("create", &tmp)?;
            file.write_all(&buf).fs_context("write", &tmp)?;
            file.sync_all().fs_context("sync", &tmp)?;
        }
        std::fs::rename(&tmp, &path).fs_context("rename", &tmp)?;
        sync_dir(dir)?;
        Ok((buf.len() / WORD_SIZE) as u64)
    }

    /// Read the binary superblock of graph `name` from `dir`
    pub fn read_from_dir(dir: &Path, name: &str) -> Result<Self> {
        let path = paths::graphstate_path(dir, name);
        let mut file = File::open(&path).fs_context("open", &path)?;
        let mut buf = Vec::with_capacity(GRAPHSTATE_BYTES);
        file.read_to_end(&mut buf).fs_context("read", &path)?;
        Self::decode(&buf, name)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .fs_context("sync", dir)
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn write_counters(w: &mut WordWriter<Vec<u8>>, counters: &TxCounters) -> Result<u64> {
    let (lo, hi) = counters.last.id.words();
    w.write_words(&[lo, hi, counters.last.serial, counters.count])
}

fn read_counters<R: Read>(r: &mut WordReader<R>) -> Result<TxCounters> {
    let lo = r.read_word()?;
    let hi = r.read_word()?;
    let serial = r.read_word()?;
    let count = r.read_word()?;
    Ok(TxCounters {
        last: TxPoint::new(TxId::from_words(lo, hi), serial),
        count,
    })
}

fn read_count<R: Read>(r: &mut WordReader<R>, what: &str) -> Result<usize> {
    let n = r.read_word()?;
    if n > MAX_ENUMERATED as u64 {
        return Err(Error::corruption(format!(
            "{} enumeration has {} entries (max {})",
            what, n, MAX_ENUMERATED
        )));
    }
    Ok(n as usize)
}

fn read_encoding<R: Read>(r: &mut WordReader<R>) -> Result<u8> {
    let enc = r.read_word()?;
    u8::try_from(enc).map_err(|_| Error::corruption(format!("Invalid enumeration code {}", enc)))
}

fn read_prefix<R: Read>(r: &mut WordReader<R>) -> Result<String> {
    let mut bytes = r.read_padded(words_for(PREFIX_BYTES))?;
    let end = bytes.iter().position(|b| *b == 0).ok_or_else(|| {
        Error::corruption("Enumeration prefix is not NUL-terminated")
    })?;
    bytes.truncate(end);
    String::from_utf8(bytes)
        .map_err(|e| Error::corruption(format!("Enumeration prefix: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::TestContext;

    fn sample() -> GraphState {
        GraphState {
            graph: GraphSection {
                order: 10,
                size: 25,
                opcount: 400,
                n_ops: 12,
                name: "people".into(),
                version: GRAPHSTATE_VERSION.into(),
                readonly: true,
                local_only: false,
                tx_out: TxCounters {
                    last: TxPoint::new(TxId(0xfeed), 77),
                    count: 9,
                },
                tx_in: TxCounters::default(),
            },
            vertex_types: vec![VertexTypeEntry {
                name: "person".into(),
                hash: 0x1234,
                encoding: 1,
                order: 10,
            }],
            relationships: vec![RelationshipEntry {
                name: "knows".into(),
                hash: 0x5678,
                encoding: 0,
                size: -1,
            }],
            properties: PropertySection {
                keys: 3,
                string_values: 4,
                properties: 30,
                strings: 5,
            },
            vectors: VectorSection {
                dimensions: 64,
                vectors: 10,
            },
            time: TimeSection {
                graph_t0: 1_700_000_000,
                tic_t0: 1_700_000_000_000,
                graph_up: 60,
                persist_t0: 1_700_000_050_000,
                persist_t1: 1_700_000_050_400,
                persist_n: 2,
                persist_t: 900,
            },
        }
    }

    #[test]
    fn test_encoded_size_is_fixed() {
        let buf = sample().encode().unwrap();
        assert_eq!(buf.len(), GRAPHSTATE_BYTES);
        assert_eq!(GraphState::decode(&buf, "people").unwrap(), sample());
    }

    #[test]
    fn test_short_file_is_corruption() {
        let buf = sample().encode().unwrap();
        let err = GraphState::decode(&buf[..4096], "people").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_damaged_section_is_corruption() {
        let mut buf = sample().encode().unwrap();
        // First word after the file header section is the GRAPH section delimiter
        let mut w = WordWriter::new(Vec::new());
        w.write_begin_file("people.graphstate.dat").unwrap();
        let at = w.words_written() as usize * WORD_SIZE;
        buf[at + 9] ^= 0xff;
        let err = GraphState::decode(&buf, "people").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_damaged_trailer_is_corruption() {
        let mut buf = sample().encode().unwrap();
        let last = buf.len() - 20;
        buf[last] ^= 0x01;
        let err = GraphState::decode(&buf, "people").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_full_enumerations_fit() {
        let mut state = sample();
        state.vertex_types = (0..MAX_ENUMERATED)
            .map(|i| VertexTypeEntry {
                name: format!("type_with_a_long_name_number_{:04}", i),
                hash: i as u64,
                encoding: i as u8,
                order: i as u64,
            })
            .collect();
        let buf = state.encode().unwrap();
        let decoded = GraphState::decode(&buf, "people").unwrap();
        assert_eq!(decoded.vertex_types.len(), MAX_ENUMERATED);
        assert_eq!(decoded.vertex_types[7].name.len(), PREFIX_BYTES - 1);
    }

    #[test]
    fn test_write_and_read_dir() {
        let ctx = TestContext::new();
        let words = sample().write_to_dir(ctx.path()).unwrap();
        assert_eq!(words as usize * WORD_SIZE, GRAPHSTATE_BYTES);
        assert!(!ctx.path().join("people.graphstate.dat.tmp").exists());
        let back = GraphState::read_from_dir(ctx.path(), "people").unwrap();
        assert_eq!(back, sample());
    }
}
