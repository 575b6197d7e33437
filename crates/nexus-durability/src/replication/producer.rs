//! Transaction producers
//!
//! A producer is one downstream subscriber connection. Its life cycle:
//!
//! ```text
//! Created → Validating → Connected → Normal | Synchronizing
//!                                        ⇅
//!                                   Disconnected → Reconnected → Normal
//!                                        │
//!                                        └──────→ Removed | Defunct
//! ```

use super::config::ReplicationConfig;
use super::protocol::{PROTOCOL_VERSION, ReplicationMessage};
use super::transport::{BoxedStream, Connector};
use super::uri::Uri;
use crate::durability::now_millis;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// How a producer joins the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    /// Subscriber is up to date
    Normal,
    /// Subscriber is being brought up to date
    SynchronizingNewSubscriber,
}

/// Producer life cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerState {
    /// Constructed, no connection yet
    Created,
    /// Throwaway validation connection in progress
    Validating,
    /// Transport connected
    Connected,
    /// Streaming in normal mode
    Normal,
    /// Streaming to a synchronizing subscriber
    Synchronizing,
    /// Transport lost
    Disconnected,
    /// Transport re-established after a loss
    Reconnected,
    /// Removed by force
    Removed,
    /// Disconnected and marked for removal
    Defunct,
}

/// Subscriber details learned during the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    /// Subscriber admin port
    pub adminport: u16,
    /// Subscriber content digest
    pub digest: String,
    /// Subscriber master serial
    pub master_serial: u64,
}

/// Replication lag of a producer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lag {
    /// Age of the oldest unsent transaction
    pub ms: u64,
    /// Transactions not yet sent
    pub tx: u64,
}

/// Structured description of an attached output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescription {
    /// Host as given in the URI
    pub host: String,
    /// Resolved address
    pub ip: String,
    /// Subscriber admin port
    pub adminport: u16,
    /// Subscriber transaction port
    pub txport: u16,
    /// `NORMAL`, `SYNCHRONIZING` or `UNKNOWN`
    pub mode: String,
    /// `CONNECTED` or `DISCONNECTED`
    pub status: String,
    /// Subscriber content digest
    pub digest: String,
    /// Subscriber master serial
    #[serde(rename = "master-serial")]
    pub master_serial: String,
    /// Replication lag
    pub lag: Lag,
}

/// Handshake parameters sent to the subscriber
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Origin identifier of this provider
    pub origin: String,
    /// Master serial of this provider
    pub master_serial: u64,
}

/// One downstream subscriber connection
pub struct Producer {
    uri: Uri,
    name: String,
    ip: Option<SocketAddr>,
    mode: Mutex<AttachMode>,
    state: Mutex<ProducerState>,
    info: Mutex<Option<SubscriberInfo>>,
    stream: tokio::sync::Mutex<Option<BoxedStream>>,
    connected: AtomicBool,
    abandoned: AtomicBool,
    cancel: tokio::sync::Notify,
    defunct: AtomicBool,
    sent: AtomicU64,
    missed: AtomicU64,
    pending: AtomicU64,
    pending_since_ms: AtomicU64,
    send_timeout: Duration,
}

impl Producer {
    /// Connect to `uri`, exchanging subscriber info when `handshake` is given
    pub async fn connect(
        uri: Uri,
        mode: AttachMode,
        connector: &dyn Connector,
        config: &ReplicationConfig,
        handshake: Option<Handshake>,
    ) -> Result<Arc<Self>> {
        let ip = connector.resolve(&uri).await?.into_iter().next();
        let mut stream = connector.connect(&uri, config.connect_timeout).await?;

        let info = match handshake {
            Some(hs) => Some(
                tokio::time::timeout(config.handshake_timeout, exchange_info(&mut stream, hs))
                    .await
                    .map_err(|_| {
                        Error::timeout(format!(
                            "Handshake with {} timed out after {}ms",
                            uri,
                            config.handshake_timeout.as_millis()
                        ))
                    })??,
            ),
            None => None,
        };

        let producer = Self {
            name: uri.to_string(),
            uri,
            ip,
            mode: Mutex::new(mode),
            state: Mutex::new(ProducerState::Connected),
            info: Mutex::new(info),
            stream: tokio::sync::Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
            abandoned: AtomicBool::new(false),
            cancel: tokio::sync::Notify::new(),
            defunct: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            pending_since_ms: AtomicU64::new(0),
            send_timeout: config.send_timeout,
        };
        producer.enter_mode(mode);
        tracing::info!("Producer connected to {} ({:?})", producer.name, mode);
        Ok(Arc::new(producer))
    }

    /// Name `scheme://host:port`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Current state
    pub fn state(&self) -> ProducerState {
        *self.state.lock()
    }

    /// Attach mode
    pub fn mode(&self) -> AttachMode {
        *self.mode.lock()
    }

    /// Subscriber info from the handshake
    pub fn info(&self) -> Option<SubscriberInfo> {
        self.info.lock().clone()
    }

    /// True while the transport is up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// True once marked for removal
    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::SeqCst)
    }

    /// Frames written
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames this producer should have received but did not
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::SeqCst)
    }

    /// True once abandoned or marked defunct
    pub fn is_retired(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst) || self.is_defunct()
    }

    pub(crate) fn note_missed(&self) {
        self.missed.fetch_add(1, Ordering::SeqCst);
    }

    fn enter_mode(&self, mode: AttachMode) {
        *self.mode.lock() = mode;
        *self.state.lock() = match mode {
            AttachMode::Normal => ProducerState::Normal,
            AttachMode::SynchronizingNewSubscriber => ProducerState::Synchronizing,
        };
    }

    /// Leave synchronizing mode
    pub fn set_normal(&self) {
        if self.is_connected() {
            self.enter_mode(AttachMode::Normal);
        }
    }

    /// Count a transaction queued for this producer
    pub(crate) fn note_enqueued(&self) {
        if self.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            self.pending_since_ms.store(now_millis(), Ordering::SeqCst);
        }
    }

    fn note_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let prev = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(p.saturating_sub(1)))
            .unwrap_or(0);
        if prev <= 1 {
            self.pending_since_ms.store(0, Ordering::SeqCst);
        } else {
            self.pending_since_ms.store(now_millis(), Ordering::SeqCst);
        }
    }

    /// Transactions queued but not yet written
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Current lag
    pub fn lag(&self) -> Lag {
        let since = self.pending_since_ms.load(Ordering::SeqCst);
        Lag {
            ms: if since == 0 {
                0
            } else {
                now_millis().saturating_sub(since)
            },
            tx: self.pending(),
        }
    }

    /// Write one encoded frame within the send timeout
    ///
    /// Any failure drops the transport and marks the producer disconnected.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::state(format!("Producer {} is not connected", self.name)));
        }
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        let mut guard = self.stream.lock().await;
        if self.abandoned.load(Ordering::SeqCst) {
            guard.take();
            return Err(Error::state(format!("Producer {} was removed", self.name)));
        }
        let Some(stream) = guard.as_mut() else {
            return Err(Error::state(format!("Producer {} has no transport", self.name)));
        };
        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        let result = tokio::select! {
            outcome = tokio::time::timeout(self.send_timeout, write) => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Io(e)),
                Err(_) => Err(Error::timeout(format!(
                    "Send to {} timed out after {}ms",
                    self.name,
                    self.send_timeout.as_millis()
                ))),
            },
            _ = &mut cancelled => Err(Error::state(format!("Producer {} was removed", self.name))),
        };
        match result {
            Ok(()) => {
                self.note_sent();
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.note_missed();
                self.mark_disconnected(&e);
                Err(e)
            }
        }
    }

    fn mark_disconnected(&self, cause: &Error) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!("Producer {} disconnected: {}", self.name, cause);
        }
        let mut state = self.state.lock();
        if !matches!(*state, ProducerState::Removed | ProducerState::Defunct) {
            *state = ProducerState::Disconnected;
        }
    }

    /// Re-establish a lost transport
    ///
    /// Returns true when frames were missed while disconnected. The producer
    /// is then put in synchronizing mode and the subscriber must be announced
    /// again before it can be trusted; see [`resynchronized`](Self::resynchronized).
    pub async fn reconnect(&self, connector: &dyn Connector, timeout: Duration) -> Result<bool> {
        if self.is_connected() || self.is_retired() {
            return Ok(false);
        }
        let stream = connector.connect(&self.uri, timeout).await?;
        *self.stream.lock().await = Some(stream);
        self.pending.store(0, Ordering::SeqCst);
        self.pending_since_ms.store(0, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        *self.state.lock() = ProducerState::Reconnected;
        tracing::info!("Producer {} reconnected", self.name);

        let missed = self.missed();
        if missed > 0 {
            tracing::warn!(
                "Producer {} missed {} frame(s) while disconnected, resynchronizing",
                self.name,
                missed
            );
            self.enter_mode(AttachMode::SynchronizingNewSubscriber);
            return Ok(true);
        }
        let mode = self.mode();
        self.enter_mode(mode);
        Ok(false)
    }

    /// Clear the missed count once the subscriber has been announced again
    pub fn resynchronized(&self) {
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Drop the transport, cancelling any in-flight write
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        *self.state.lock() = ProducerState::Removed;
        // Wakes a writer blocked on a full transport; it drops the stream
        self.cancel.notify_waiters();
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
        tracing::info!("Producer {} abandoned", self.name);
    }

    /// Mark a disconnected producer for removal
    pub fn set_defunct(&self) {
        self.defunct.store(true, Ordering::SeqCst);
        *self.state.lock() = ProducerState::Defunct;
    }

    /// Structured description
    pub fn describe(&self) -> OutputDescription {
        let info = self.info().unwrap_or_default();
        let mode = match self.state() {
            ProducerState::Normal | ProducerState::Reconnected => "NORMAL",
            ProducerState::Synchronizing => "SYNCHRONIZING",
            _ => "UNKNOWN",
        };
        OutputDescription {
            host: self.uri.host.clone(),
            ip: self.ip.map(|a| a.ip().to_string()).unwrap_or_default(),
            adminport: info.adminport,
            txport: self.uri.port,
            mode: mode.to_string(),
            status: if self.is_connected() {
                "CONNECTED"
            } else {
                "DISCONNECTED"
            }
            .to_string(),
            digest: info.digest,
            master_serial: format!("{:016x}", info.master_serial),
            lag: self.lag(),
        }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn exchange_info(stream: &mut BoxedStream, hs: Handshake) -> Result<SubscriberInfo> {
    ReplicationMessage::Hello {
        origin: hs.origin,
        master_serial: hs.master_serial,
        protocol_version: PROTOCOL_VERSION,
    }
    .write_to(stream)
    .await?;
    match ReplicationMessage::read_from(stream).await? {
        ReplicationMessage::SubscriberInfo {
            adminport,
            digest,
            master_serial,
        } => Ok(SubscriberInfo {
            adminport,
            digest,
            master_serial,
        }),
        ReplicationMessage::Error { code, message } => Err(Error::topology(format!(
            "Subscriber refused handshake ({}): {}",
            code, message
        ))),
        other => Err(Error::protocol(format!(
            "Expected SubscriberInfo, got {:?}",
            other.message_type()
        ))),
    }
}

/// Result of one [`ProducerRegistry::broadcast`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Broadcast {
    /// Producers the frame was written to
    pub delivered: usize,
    /// Producers whose write failed and dropped the transport
    pub failed: usize,
}

/// Registered producers
#[derive(Debug, Default)]
pub struct ProducerRegistry {
    producers: RwLock<Vec<Arc<Producer>>>,
}

impl ProducerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer; names are unique
    pub fn add(&self, producer: Arc<Producer>) -> Result<()> {
        let mut producers = self.producers.write();
        if producers.iter().any(|p| p.name() == producer.name()) {
            return Err(Error::topology(format!(
                "Subscriber already exists: {}",
                producer.name()
            )));
        }
        producers.push(producer);
        Ok(())
    }

    /// Unregister by name
    pub fn remove(&self, name: &str) -> Option<Arc<Producer>> {
        let mut producers = self.producers.write();
        let pos = producers.iter().position(|p| p.name() == name)?;
        Some(producers.remove(pos))
    }

    /// Look up by name
    pub fn get(&self, name: &str) -> Option<Arc<Producer>> {
        self.producers
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// True if `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.producers.read().iter().any(|p| p.name() == name)
    }

    /// Snapshot of all producers
    pub fn list(&self) -> Vec<Arc<Producer>> {
        self.producers.read().clone()
    }

    /// Registered names in attach order
    pub fn names(&self) -> Vec<String> {
        self.producers
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Unregister everything
    pub fn clear(&self) -> Vec<Arc<Producer>> {
        std::mem::take(&mut *self.producers.write())
    }

    /// Number of producers
    pub fn len(&self) -> usize {
        self.producers.read().len()
    }

    /// True when no producer is registered
    pub fn is_empty(&self) -> bool {
        self.producers.read().is_empty()
    }

    /// True if any producer is connected
    pub fn has_connected(&self) -> bool {
        self.producers.read().iter().any(|p| p.is_connected())
    }

    /// Count a queued transaction against every connected producer
    pub fn note_enqueued(&self) {
        for p in self.producers.read().iter().filter(|p| p.is_connected()) {
            p.note_enqueued();
        }
    }

    /// Transactions queued but not written, summed over producers
    pub fn pending_total(&self) -> u64 {
        self.producers.read().iter().map(|p| p.pending()).sum()
    }

    /// Write a frame to every connected producer
    ///
    /// Registered producers that are down, but not retired, have the frame
    /// counted as missed. The registry lock is not held while writing.
    pub async fn broadcast(&self, frame: &[u8]) -> Broadcast {
        let targets = self.list();
        let mut outcome = Broadcast::default();
        for producer in targets {
            if !producer.is_connected() {
                if !producer.is_retired() {
                    producer.note_missed();
                }
                continue;
            }
            match producer.send_frame(frame).await {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::debug!("Broadcast to {} failed: {}", producer.name(), e);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::testing::{MockSubscriber, StalledConnector};

    async fn connect(uri: &str, connector: &dyn Connector) -> Arc<Producer> {
        Producer::connect(
            Uri::parse(uri, "vgx").unwrap(),
            AttachMode::Normal,
            connector,
            &ReplicationConfig::default().with_send_timeout(Duration::from_millis(200)),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_reads_subscriber_info() {
        let sub = MockSubscriber::start().await;
        let producer = Producer::connect(
            sub.uri(),
            AttachMode::SynchronizingNewSubscriber,
            &super::super::transport::TcpConnector,
            &ReplicationConfig::default(),
            Some(Handshake {
                origin: "test".into(),
                master_serial: 42,
            }),
        )
        .await
        .unwrap();
        assert_eq!(producer.state(), ProducerState::Synchronizing);
        let info = producer.info().unwrap();
        assert_eq!(info.digest, sub.digest());
        let desc = producer.describe();
        assert_eq!(desc.mode, "SYNCHRONIZING");
        assert_eq!(desc.status, "CONNECTED");
        assert_eq!(desc.txport, sub.uri().port);
        let json = serde_json::to_value(&desc).unwrap();
        assert!(json.get("master-serial").is_some());
        sub.stop().await;
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates() {
        let connector = StalledConnector::new();
        let registry = ProducerRegistry::new();
        registry.add(connect("vgx://a:1", &connector).await).unwrap();
        let err = registry
            .add(connect("vgx://a:1", &connector).await)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Topology);
        assert!(err.to_string().contains("Subscriber already exists"));
        assert_eq!(registry.names(), vec!["vgx://a:1".to_string()]);
    }

    #[tokio::test]
    async fn test_stalled_send_disconnects() {
        let connector = StalledConnector::new();
        let producer = connect("vgx://slow:1", &connector).await;
        let frame = vec![0u8; 4096];
        let err = producer.send_frame(&frame).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!producer.is_connected());
        assert_eq!(producer.state(), ProducerState::Disconnected);
        assert_eq!(producer.missed(), 1);

        // The lost frame forces a resync
        assert!(producer.reconnect(&connector, Duration::from_secs(1)).await.unwrap());
        assert!(producer.is_connected());
        assert_eq!(producer.state(), ProducerState::Synchronizing);
        assert_eq!(producer.describe().mode, "SYNCHRONIZING");
        producer.resynchronized();
        assert_eq!(producer.missed(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_counts_missed_frames() {
        let connector = StalledConnector::new();
        let registry = ProducerRegistry::new();
        let down = connect("vgx://down:1", &connector).await;
        let gone = connect("vgx://gone:1", &connector).await;
        registry.add(Arc::clone(&down)).unwrap();
        registry.add(Arc::clone(&gone)).unwrap();

        // Both transports stall on a frame larger than the buffer
        let outcome = registry.broadcast(&[0u8; 4096]).await;
        assert_eq!(outcome, Broadcast { delivered: 0, failed: 2 });

        gone.abandon();
        registry.broadcast(b"x").await;
        assert_eq!(down.missed(), 2);
        assert_eq!(gone.missed(), 1);

        // A clean reconnect keeps the previous mode
        let fresh = connect("vgx://fresh:1", &connector).await;
        fresh.mark_disconnected(&Error::state("dropped"));
        assert!(!fresh.reconnect(&connector, Duration::from_secs(1)).await.unwrap());
        assert_eq!(fresh.state(), ProducerState::Normal);
    }

    #[tokio::test]
    async fn test_abandon_and_defunct() {
        let connector = StalledConnector::new();
        let producer = connect("vgx://gone:1", &connector).await;
        producer.abandon();
        assert_eq!(producer.state(), ProducerState::Removed);
        assert!(producer.send_frame(b"x").await.is_err());
        producer.set_defunct();
        assert!(producer.is_defunct());
        assert_eq!(producer.describe().status, "DISCONNECTED");
    }

    #[tokio::test]
    async fn test_lag_tracks_pending() {
        let sub = MockSubscriber::start().await;
        let registry = ProducerRegistry::new();
        let producer = connect(&sub.uri().to_string(), &super::super::transport::TcpConnector).await;
        registry.add(Arc::clone(&producer)).unwrap();
        registry.note_enqueued();
        registry.note_enqueued();
        assert_eq!(producer.lag().tx, 2);
        assert_eq!(registry.pending_total(), 2);
        let frame = ReplicationMessage::Error {
            code: 0,
            message: "noop".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(registry.broadcast(&frame).await.delivered, 1);
        assert_eq!(producer.lag().tx, 1);
        sub.stop().await;
    }
}
