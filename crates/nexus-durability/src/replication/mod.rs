//! Replication topology
//!
//! ```text
//! ┌────────── provider ──────────┐          ┌──────── subscriber ────────┐
//! │ Graph::capture               │          │                            │
//! │   └► Emitter (one per graph) │  frames  │ ConsumerService            │
//! │        └► ProducerRegistry ──┼─────────►│   └► TxValidator           │
//! │             Producer × N     │   TCP    │   └► Graph::record_inbound │
//! │ ReplicationManager           │          │                            │
//! │   attach / detach / fence    │          │                            │
//! └──────────────────────────────┘          └────────────────────────────┘
//! ```
//!
//! - [`ReplicationManager`]: attach/detach of downstream subscribers
//! - [`Emitter`]: per-graph ordered queue of captured commit groups
//! - [`Producer`]: one subscriber connection and its state machine
//! - [`ConsumerService`]: inbound listener applying upstream transactions
//! - [`protocol`]: CRC-checked wire frames

pub mod config;
pub mod consumer;
pub mod emitter;
pub mod producer;
pub mod protocol;
pub mod topology;
pub mod transport;
pub mod uri;
pub mod validator;

pub use config::{DEFAULT_TXPORT, MIN_ATTACH_TIMEOUT, ReplicationConfig};
pub use consumer::{ConsumerService, ConsumerStats};
pub use emitter::{Emitter, EmitterStats, Fence};
pub use producer::{
    AttachMode, Broadcast, Lag, OutputDescription, Producer, ProducerRegistry, ProducerState,
    SubscriberInfo,
};
pub use protocol::{CommitGroup, Operation, PROTOCOL_VERSION, ReplicationMessage};
pub use topology::ReplicationManager;
pub use transport::{BoxedStream, Connector, TcpConnector, TransportStream};
pub use uri::Uri;
pub use validator::TxValidator;
