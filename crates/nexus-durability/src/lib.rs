//! Nexus Durability - snapshots, virtual properties and output replication
//!
//! This crate provides the durability and replication core of an embedded
//! graph database:
//! - Word-aligned binary framing for every persisted file
//! - Graph snapshots with readonly gating, ordered collaborators and rollback
//! - Append-mostly virtual property log with in-place updates before commit
//! - Output topology: attach/detach subscribers, per-graph emitters, fencing
//! - Durability point and process-wide master serial
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  System                      │
//! │   system graph, user graphs, master serial  │
//! └───────┬─────────────────────────┬───────────┘
//!         │                         │
//! ┌───────┴────────────┐  ┌─────────┴───────────┐
//! │   Snapshot layer    │  │  Replication layer  │
//! │ coordinator, vprop  │  │ producers, emitters │
//! │ graphstate, report  │  │ consumer, protocol  │
//! └───────┬────────────┘  └─────────┬───────────┘
//!         │                         │
//! ┌───────┴─────────────────────────┴───────────┐
//! │      Codec (words, delimiters, digests)     │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod durability;
pub mod error;
pub mod graph;
pub mod replication;
pub mod snapshot;
pub mod system;
pub mod testing;
pub mod vprop;

pub use config::DurabilityConfig;
pub use durability::{DurabilityPoint, MasterSerial, TxId, TxPoint};
pub use error::{Error, ErrorKind, Result};
pub use graph::{Graph, GraphId, GraphOptions};
pub use system::System;
