//! Live storage updates: push fan-out for long-lived streams and the
//! stateless poll used when a client can't keep a stream open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::changes::{unix_now, ChangeDetector, ChangeEvent, StorageSnapshot};

/// stats block carried by update messages and poll responses
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsPayload {
    pub file_count: u64,
    pub dir_count: u64,
    pub total_size: u64,
    pub last_modified: f64,
    pub content_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<ChangeEvent>,
}

impl StatsPayload {
    pub fn new(snapshot: &StorageSnapshot, changes: Option<ChangeEvent>) -> Self {
        Self {
            file_count: snapshot.file_count,
            dir_count: snapshot.dir_count,
            total_size: snapshot.total_size,
            last_modified: snapshot.last_modified,
            content_fingerprint: snapshot.content_fingerprint.clone(),
            changes,
        }
    }
}

/// one message on a push stream, serialized as `{"type": ..., ...}`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    Connected {
        timestamp: f64,
    },
    StorageStatsUpdate {
        timestamp: f64,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        initial: bool,
        data: StatsPayload,
    },
    Ping {
        timestamp: f64,
    },
    /// the client fell behind and missed updates; it should refetch
    Resync {
        timestamp: f64,
        missed: u64,
    },
}

impl LiveMessage {
    pub fn initial(snapshot: &StorageSnapshot) -> Self {
        LiveMessage::StorageStatsUpdate {
            timestamp: unix_now(),
            initial: true,
            data: StatsPayload::new(snapshot, None),
        }
    }

    pub fn update(snapshot: &StorageSnapshot, event: &ChangeEvent) -> Self {
        LiveMessage::StorageStatsUpdate {
            timestamp: snapshot.timestamp,
            initial: false,
            data: StatsPayload::new(snapshot, Some(event.clone())),
        }
    }
}

/// fan-out of change notifications to every connected push stream.
/// a slow client only loses its own backlog, it never blocks the others
pub struct Broadcaster {
    tx: broadcast::Sender<LiveMessage>,
    keepalive: Duration,
    total_connections: AtomicU64,
}

impl Broadcaster {
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            keepalive,
            total_connections: AtomicU64::new(0),
        }
    }

    /// publish one change; returns how many streams it was queued for
    pub fn publish_update(&self, snapshot: &StorageSnapshot, event: &ChangeEvent) -> usize {
        self.tx
            .send(LiveMessage::update(snapshot, event))
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveMessage> {
        self.tx.subscribe()
    }

    /// currently connected push streams
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// open a push stream: a `connected` message, the current snapshot marked
    /// initial, then every later change interleaved with keep-alive pings.
    /// the stream ends when it is dropped or the broadcaster goes away
    pub fn open_stream(&self, detector: &ChangeDetector) -> impl Stream<Item = LiveMessage> + Send + 'static {
        // subscribe before reading the snapshot so nothing falls in between
        let rx = self.tx.subscribe();
        let snapshot = detector.current();
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let client = ClientGuard::new(self.client_count());

        let opening = stream::iter([
            LiveMessage::Connected {
                timestamp: unix_now(),
            },
            LiveMessage::initial(&snapshot),
        ]);

        let keepalive = self.keepalive.max(Duration::from_millis(10));
        let ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);

        let updates = stream::unfold((rx, ticker, client), |(mut rx, mut ticker, client)| async move {
            let message = tokio::select! {
                _ = ticker.tick() => LiveMessage::Ping { timestamp: unix_now() },
                received = rx.recv() => match received {
                    Ok(message) => message,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!("Live client lagged, {} updates dropped", missed);
                        LiveMessage::Resync { timestamp: unix_now(), missed }
                    }
                    Err(RecvError::Closed) => return None,
                },
            };
            Some((message, (rx, ticker, client)))
        });

        opening.chain(updates)
    }
}

// logs connect and disconnect of a push stream
struct ClientGuard;

impl ClientGuard {
    fn new(connected: usize) -> Self {
        tracing::info!("🔌 Live client connected ({} total)", connected);
        ClientGuard
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        tracing::info!("🔌 Live client disconnected");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResponse {
    pub timestamp: f64,
    pub changed: bool,
    pub data: StatsPayload,
}

/// compare what the client last saw against the current snapshot.
/// a client that doesn't send its counts is always told something changed
pub fn poll(current: &StorageSnapshot, last_files: Option<u64>, last_dirs: Option<u64>) -> PollResponse {
    let changed = match (last_files, last_dirs) {
        (Some(files), Some(dirs)) => files != current.file_count || dirs != current.dir_count,
        _ => true,
    };
    PollResponse {
        timestamp: unix_now(),
        changed,
        data: StatsPayload::new(current, None),
    }
}
