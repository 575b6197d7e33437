//! Human-readable `.adoc` rendering of a [`GraphState`]
//!
//! Written next to the binary superblock for operators; never read back.

use super::paths;
use super::state::GraphState;
use crate::Result;
use crate::error::IoResultExt;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::Path;

fn format_millis(ms: u64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms as i64) {
        Some(ts) if ms > 0 => ts.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        _ => "-".to_string(),
    }
}

fn format_secs(secs: u64) -> String {
    match DateTime::<Utc>::from_timestamp(secs as i64, 0) {
        Some(ts) if secs > 0 => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        _ => "-".to_string(),
    }
}

/// Render the report text
pub fn render(state: &GraphState) -> String {
    let g = &state.graph;
    let t = &state.time;
    let mut out = String::new();

    let _ = writeln!(out, "= Graph State: {}", g.name);
    let _ = writeln!(out, ":generated: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out);

    let _ = writeln!(out, "== Graph");
    let _ = writeln!(out, "[cols=\"1,2\"]");
    let _ = writeln!(out, "|===");
    let _ = writeln!(out, "|Name |{}", g.name);
    let _ = writeln!(out, "|Version |{}", g.version);
    let _ = writeln!(out, "|Order |{}", g.order);
    let _ = writeln!(out, "|Size |{}", g.size);
    let _ = writeln!(out, "|Operations |{}", g.opcount);
    let _ = writeln!(out, "|Operations since last snapshot |{}", g.n_ops);
    let _ = writeln!(out, "|Readonly |{}", g.readonly);
    let _ = writeln!(out, "|Local only |{}", g.local_only);
    let _ = writeln!(
        out,
        "|Outbound |{} (serial {}, count {})",
        g.tx_out.last.id, g.tx_out.last.serial, g.tx_out.count
    );
    let _ = writeln!(
        out,
        "|Inbound |{} (serial {}, count {})",
        g.tx_in.last.id, g.tx_in.last.serial, g.tx_in.count
    );
    let _ = writeln!(out, "|===");
    let _ = writeln!(out);

    let _ = writeln!(out, "== Vertex Types ({})", state.vertex_types.len());
    let _ = writeln!(out, "|===");
    let _ = writeln!(out, "|Code |Name |Hash |Order");
    for e in &state.vertex_types {
        let _ = writeln!(out, "|{} |{} |{:016x} |{}", e.encoding, e.name, e.hash, e.order);
    }
    let _ = writeln!(out, "|===");
    let _ = writeln!(out);

    let _ = writeln!(out, "== Relationships ({})", state.relationships.len());
    let _ = writeln!(out, "|===");
    let _ = writeln!(out, "|Code |Name |Hash |Size");
    for e in &state.relationships {
        let _ = writeln!(out, "|{} |{} |{:016x} |{}", e.encoding, e.name, e.hash, e.size);
    }
    let _ = writeln!(out, "|===");
    let _ = writeln!(out);

    let p = &state.properties;
    let _ = writeln!(out, "== Properties");
    let _ = writeln!(out, "|===");
    let _ = writeln!(out, "|Keys |{}", p.keys);
    let _ = writeln!(out, "|String values |{}", p.string_values);
    let _ = writeln!(out, "|Properties |{}", p.properties);
    let _ = writeln!(out, "|Strings |{}", p.strings);
    let _ = writeln!(out, "|===");
    let _ = writeln!(out);

    let _ = writeln!(out, "== Vectors");
    let _ = writeln!(out, "|===");
    let _ = writeln!(out, "|Dimensions |{}", state.vectors.dimensions);
    let _ = writeln!(out, "|Vectors |{}", state.vectors.vectors);
    let _ = writeln!(out, "|===");
    let _ = writeln!(out);

    let _ = writeln!(out, "== Time");
    let _ = writeln!(out, "|===");
    let _ = writeln!(out, "|Graph inception |{}", format_secs(t.graph_t0));
    let _ = writeln!(out, "|Process start |{}", format_millis(t.tic_t0));
    let _ = writeln!(out, "|Uptime |{} s", t.graph_up);
    let _ = writeln!(out, "|Persist start |{}", format_millis(t.persist_t0));
    let _ = writeln!(out, "|Persist end |{}", format_millis(t.persist_t1));
    let _ = writeln!(out, "|Snapshots |{}", t.persist_n);
    let _ = writeln!(out, "|Total persist time |{:.3} s", t.persist_t as f64 / 1000.0);
    let _ = writeln!(out, "|===");

    out
}

/// Write `<dir>/<name>.graphstate.adoc`
pub fn write_report(dir: &Path, state: &GraphState) -> Result<()> {
    let path = paths::report_path(dir, &state.graph.name);
    std::fs::write(&path, render(state)).fs_context("write", &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VertexTypeEntry;

    #[test]
    fn test_render_tables() {
        let mut state = GraphState::default();
        state.graph.name = "people".into();
        state.graph.order = 42;
        state.vertex_types.push(VertexTypeEntry {
            name: "person".into(),
            hash: 1,
            encoding: 3,
            order: 42,
        });
        state.time.persist_t1 = 1_700_000_000_123;
        let text = render(&state);
        assert!(text.starts_with("= Graph State: people"));
        assert!(text.contains("|Order |42"));
        assert!(text.contains("|3 |person |0000000000000001 |42"));
        assert!(text.contains("2023-11-14 22:13:20.123 UTC"));
        assert!(text.contains("|Persist start |-"));
        assert_eq!(text.matches("|===").count(), 12);
    }
}
