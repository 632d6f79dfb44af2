//! Per-server statistics and per-connection records.
//!
//! Counters are atomics so the accept task, the relay tasks and the close
//! path can update them without holding the engine lock; readers take
//! [`StatsSnapshot`] copies instead of observing the live counters field by
//! field.

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Aggregate counters for one SOCKS5 server.
#[derive(Debug)]
pub struct ProxyStats {
    /// Connections accepted since start
    total: AtomicU64,
    /// Connections currently relaying
    active: AtomicU64,
    /// Handshake, dial and capacity failures
    failed: AtomicU64,
    /// Bytes relayed in both directions
    total_bytes: AtomicU64,
    /// When the server started
    start_time: Instant,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            active: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an accepted client.
    pub fn record_accept(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection that never reached the relay phase.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection entering the relay phase.
    pub fn record_relay_start(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a relayed connection closing.
    pub fn record_relay_end(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Add relayed bytes (either direction).
    pub fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Number of connections currently relaying.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Copy the counters for a reader.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            uptime: self.start_time.elapsed(),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub active: u64,
    pub failed: u64,
    pub total_bytes: u64,
    #[serde(skip)]
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// Success rate in percent. An empty sample counts as fully healthy.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.total + self.failed;
        if attempts == 0 {
            100.0
        } else {
            self.total as f64 / attempts as f64 * 100.0
        }
    }
}

/// One relayed client connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: u64,
    pub start_time: Instant,
    pub client_addr: SocketAddr,
    pub target_addr: String,
    pub target_port: u16,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active: AtomicBool,
    end_time: Mutex<Option<Instant>>,
}

impl ConnectionRecord {
    pub fn new(id: u64, client_addr: SocketAddr, target_addr: String, target_port: u16) -> Self {
        Self {
            id,
            start_time: Instant::now(),
            client_addr,
            target_addr,
            target_port,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active: AtomicBool::new(true),
            end_time: Mutex::new(None),
        }
    }

    /// Add client-to-target bytes.
    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Add target-to-client bytes.
    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Close the record. Returns true only on the first call, so the
    /// aggregate `active` counter is decremented exactly once per record.
    pub fn close(&self) -> bool {
        if self.active.swap(false, Ordering::AcqRel) {
            *self.end_time.lock().unwrap() = Some(Instant::now());
            true
        } else {
            false
        }
    }
}

/// The engine's table of live connection records.
///
/// Records are inserted by the relay task that owns them and removed on
/// close; readers only ever see consistent `Arc` clones.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    next_id: AtomicU64,
    inner: Mutex<HashMap<u64, Arc<ConnectionRecord>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next connection id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, record: Arc<ConnectionRecord>) {
        self.inner.lock().unwrap().insert(record.id, record);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<ConnectionRecord>> {
        self.inner.lock().unwrap().remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Number of records still marked active.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.is_active())
            .count()
    }

    /// Close every record and clear the table. Used on engine stop.
    pub fn close_all(&self, stats: &ProxyStats) {
        let mut map = self.inner.lock().unwrap();
        for record in map.values() {
            if record.close() {
                stats.record_relay_end();
            }
        }
        map.clear();
    }
}
