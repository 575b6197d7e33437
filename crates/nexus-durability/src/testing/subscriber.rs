//! Replication test doubles

use crate::Result;
use crate::replication::{BoxedStream, CommitGroup, Connector, ReplicationMessage, Uri};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const MOCK_DIGEST: &str = "0000000000000000000000000000beef";
const MOCK_ADMINPORT: u16 = 9999;

/// TCP subscriber that answers handshakes and records transactions
pub struct MockSubscriber {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<CommitGroup>>>,
    handshakes: Arc<AtomicU64>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockSubscriber {
    /// Listen on an ephemeral loopback port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock subscriber");
        let addr = listener.local_addr().expect("Mock subscriber has no address");
        let received = Arc::new(Mutex::new(Vec::new()));
        let handshakes = Arc::new(AtomicU64::new(0));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let rx_received = Arc::clone(&received);
        let rx_handshakes = Arc::clone(&handshakes);
        let rx_connections = Arc::clone(&connections);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            let conn = tokio::spawn(serve(
                                stream,
                                Arc::clone(&rx_received),
                                Arc::clone(&rx_handshakes),
                            ));
                            rx_connections.lock().push(conn);
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            received,
            handshakes,
            connections,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `vgx://127.0.0.1:<port>`
    pub fn uri(&self) -> Uri {
        Uri {
            scheme: "vgx".into(),
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }

    /// Digest reported in handshakes
    pub fn digest(&self) -> String {
        MOCK_DIGEST.to_string()
    }

    /// Handshakes answered
    pub fn handshakes(&self) -> u64 {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Transactions received so far
    pub fn transactions(&self) -> Vec<CommitGroup> {
        self.received.lock().clone()
    }

    /// Number of transactions received so far
    pub fn transaction_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Wait until at least `n` transactions arrived
    pub async fn wait_for_transactions(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.transaction_count() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Close every accepted connection but keep listening
    pub fn drop_connections(&self) {
        for conn in self.connections.lock().drain(..) {
            conn.abort();
        }
    }

    /// Stop listening
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn serve(
    mut stream: TcpStream,
    received: Arc<Mutex<Vec<CommitGroup>>>,
    handshakes: Arc<AtomicU64>,
) {
    loop {
        match ReplicationMessage::read_from(&mut stream).await {
            Ok(ReplicationMessage::Hello { .. }) => {
                handshakes.fetch_add(1, Ordering::SeqCst);
                let info = ReplicationMessage::SubscriberInfo {
                    adminport: MOCK_ADMINPORT,
                    digest: MOCK_DIGEST.to_string(),
                    master_serial: 1,
                };
                if info.write_to(&mut stream).await.is_err() {
                    return;
                }
            }
            Ok(ReplicationMessage::Transaction(group)) => received.lock().push(group),
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

/// Connector whose streams are never read by the peer
///
/// Writes succeed until the 64-byte in-memory buffer fills, then block.
/// `resolve` answers with a documentation-range address.
#[derive(Default)]
pub struct StalledConnector {
    peers: Mutex<Vec<DuplexStream>>,
    connects: AtomicU64,
}

impl StalledConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened, including validation connections
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StalledConnector {
    async fn resolve(&self, uri: &Uri) -> Result<Vec<SocketAddr>> {
        Ok(vec![SocketAddr::from(([192, 0, 2, 1], uri.port))])
    }

    async fn connect(&self, _uri: &Uri, _timeout: Duration) -> Result<BoxedStream> {
        let (ours, theirs) = tokio::io::duplex(64);
        self.peers.lock().push(theirs);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ours))
    }
}
