use crate::config::UpstreamSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// An upstream socket checked out of (or destined for) the pool.
///
/// Connections obtained from `checkout` remember the slot that stays
/// reserved for them; freshly dialled ones carry no slot until checkin.
pub struct UpstreamConn {
    pub stream: TcpStream,
    slot_id: Option<u64>,
}

impl UpstreamConn {
    /// Whether this connection came out of the pool rather than a fresh
    /// dial. Pool reuse is speculative: the origin may have closed its end,
    /// so the first failed exchange on a pooled connection warrants a retry
    /// over a fresh one.
    pub fn is_pooled(&self) -> bool {
        self.slot_id.is_some()
    }
}

struct Slot {
    id: u64,
    host: String,
    port: u16,
    /// Present while the connection is parked; taken while checked out.
    stream: Option<TcpStream>,
    last_used: Instant,
    in_use: bool,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    total_dialed: AtomicU64,
    expired: AtomicU64,
    returned: AtomicU64,
    dropped_full: AtomicU64,
    closed_no_keep_alive: AtomicU64,
}

/// Snapshot of pool state.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub total_dialed: u64,
    pub expired: u64,
    pub returned: u64,
    pub dropped_full: u64,
}

/// Keyed pool of upstream TCP connections.
///
/// A flat, fixed-size slot table behind one mutex; lookup is a linear scan
/// over a small bound. The lock covers only slot bookkeeping — all socket
/// I/O happens on streams moved out of the table. A checked-out slot stays
/// reserved (`in_use`) until the connection comes back, so the same socket
/// can never surface in two slots or two workers at once.
pub struct UpstreamPool {
    slots: Mutex<Vec<Option<Slot>>>,
    capacity: usize,
    keep_alive: Duration,
    connect_timeout: Duration,
    next_id: AtomicU64,
    metrics: PoolMetrics,
}

impl UpstreamPool {
    pub fn new(settings: &UpstreamSettings) -> Self {
        let capacity = settings.capacity;
        info!(capacity, "Upstream connection pool created");

        Self {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            capacity,
            keep_alive: settings.keep_alive(),
            connect_timeout: settings.connect_timeout(),
            next_id: AtomicU64::new(1),
            metrics: PoolMetrics::default(),
        }
    }

    /// Borrow an idle connection to `(host, port)` that is still inside
    /// the keep-alive window. Expired matches found along the way are
    /// closed in place. `None` tells the caller to dial.
    pub fn checkout(&self, host: &str, port: u16) -> Option<UpstreamConn> {
        let now = Instant::now();
        let mut slots = self.lock();

        for entry in slots.iter_mut() {
            let Some(slot) = entry.as_mut() else { continue };
            if slot.in_use || slot.port != port || !slot.host.eq_ignore_ascii_case(host) {
                continue;
            }

            if now.duration_since(slot.last_used) >= self.keep_alive {
                trace!(host, port, "Discarding idle upstream connection past keep-alive");
                self.metrics.expired.fetch_add(1, Ordering::Relaxed);
                *entry = None;
                continue;
            }

            slot.in_use = true;
            slot.last_used = now;
            let stream = slot.stream.take().expect("idle slot holds a stream");
            let slot_id = slot.id;

            debug!(host, port, "♻️  Reusing pooled upstream connection");
            self.metrics.pool_hits.fetch_add(1, Ordering::Relaxed);

            return Some(UpstreamConn {
                stream,
                slot_id: Some(slot_id),
            });
        }

        self.metrics.pool_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Dial a fresh upstream connection with the configured timeout.
    pub async fn connect(&self, host: &str, port: u16) -> std::io::Result<UpstreamConn> {
        debug!(host, port, "🔌 Dialling upstream");

        let stream = match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "connection to {}:{} timed out after {:?}",
                        host, port, self.connect_timeout
                    ),
                ))
            }
        };

        self.metrics.total_dialed.fetch_add(1, Ordering::Relaxed);
        Ok(UpstreamConn {
            stream,
            slot_id: None,
        })
    }

    /// Give a connection back. Without keep-alive the socket is closed and
    /// its slot (if any) freed; with keep-alive it returns to its reserved
    /// slot, claims a free one, or is closed when the table is full.
    pub fn checkin(&self, conn: UpstreamConn, host: &str, port: u16, keep_alive: bool) {
        let UpstreamConn { stream, slot_id } = conn;
        let now = Instant::now();
        let mut slots = self.lock();

        if !keep_alive {
            if let Some(id) = slot_id {
                if let Some(entry) = slots.iter_mut().find(|e| matches!(e, Some(s) if s.id == id)) {
                    *entry = None;
                }
            }
            self.metrics
                .closed_no_keep_alive
                .fetch_add(1, Ordering::Relaxed);
            debug!(host, port, "Upstream connection closed (no keep-alive)");
            return;
        }

        if let Some(id) = slot_id {
            if let Some(slot) = slots.iter_mut().flatten().find(|s| s.id == id) {
                slot.stream = Some(stream);
                slot.in_use = false;
                slot.last_used = now;
                self.metrics.returned.fetch_add(1, Ordering::Relaxed);
                debug!(host, port, "💾 Upstream connection returned to its slot");
                return;
            }
        }

        if let Some(entry) = slots.iter_mut().find(|e| e.is_none()) {
            *entry = Some(Slot {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                host: host.to_ascii_lowercase(),
                port,
                stream: Some(stream),
                last_used: now,
                in_use: false,
            });
            self.metrics.returned.fetch_add(1, Ordering::Relaxed);
            debug!(host, port, "💾 Upstream connection added to pool");
            return;
        }

        self.metrics.dropped_full.fetch_add(1, Ordering::Relaxed);
        debug!(host, port, "Pool full, closing upstream connection");
    }

    /// Close idle connections past the keep-alive window.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut cleaned = 0;
        let mut slots = self.lock();

        for entry in slots.iter_mut() {
            let stale = matches!(
                entry,
                Some(slot) if !slot.in_use
                    && now.duration_since(slot.last_used) >= self.keep_alive
            );
            if stale {
                *entry = None;
                cleaned += 1;
            }
        }
        drop(slots);

        if cleaned > 0 {
            self.metrics
                .expired
                .fetch_add(cleaned as u64, Ordering::Relaxed);
            debug!(cleaned, "Sweep closed idle upstream connections");
        }
        cleaned
    }

    /// Close everything, reserved slots included.
    pub fn clear(&self) {
        let mut slots = self.lock();
        for entry in slots.iter_mut() {
            *entry = None;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.lock();
        let idle = slots
            .iter()
            .flatten()
            .filter(|s| !s.in_use)
            .count();
        let checked_out = slots.iter().flatten().filter(|s| s.in_use).count();
        drop(slots);

        PoolStats {
            capacity: self.capacity,
            idle,
            checked_out,
            pool_hits: self.metrics.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.metrics.pool_misses.load(Ordering::Relaxed),
            total_dialed: self.metrics.total_dialed.load(Ordering::Relaxed),
            expired: self.metrics.expired.load(Ordering::Relaxed),
            returned: self.metrics.returned.load(Ordering::Relaxed),
            dropped_full: self.metrics.dropped_full.load(Ordering::Relaxed),
        }
    }

    /// Background task closing idle connections at half the keep-alive
    /// window until shutdown.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let every = (pool.keep_alive / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        pool.sweep_idle();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Slot>>> {
        self.slots.lock().expect("upstream pool mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings(capacity: usize, keep_alive_secs: u64) -> UpstreamSettings {
        UpstreamSettings {
            capacity,
            keep_alive_secs,
            connect_timeout_ms: 5000,
            recv_timeout_ms: 5000,
        }
    }

    async fn local_origin() -> (TcpListener, String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr.ip().to_string(), addr.port())
    }

    fn spawn_acceptor(listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        // Keep accepted sockets open so the pool side stays live.
                        tokio::spawn(async move {
                            let _stream = stream;
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    #[tokio::test]
    async fn checkout_on_empty_pool_misses() {
        let pool = UpstreamPool::new(&settings(4, 30));
        assert!(pool.checkout("example.com", 80).is_none());
        assert_eq!(pool.stats().pool_misses, 1);
    }

    #[tokio::test]
    async fn returned_connection_is_reused() {
        let pool = UpstreamPool::new(&settings(4, 30));
        let (listener, host, port) = local_origin().await;
        spawn_acceptor(listener);

        let conn = pool.connect(&host, port).await.unwrap();
        let dialed_local = conn.stream.local_addr().unwrap();
        pool.checkin(conn, &host, port, true);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.returned, 1);

        let reused = pool.checkout(&host, port).expect("pooled connection");
        assert_eq!(reused.stream.local_addr().unwrap(), dialed_local);
        assert_eq!(pool.stats().idle, 0);

        // Round-trips back into the same slot.
        pool.checkin(reused, &host, port, true);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn no_keep_alive_closes_instead_of_pooling() {
        let pool = UpstreamPool::new(&settings(4, 30));
        let (listener, host, port) = local_origin().await;
        spawn_acceptor(listener);

        let conn = pool.connect(&host, port).await.unwrap();
        pool.checkin(conn, &host, port, false);

        assert_eq!(pool.stats().idle, 0);
        assert!(pool.checkout(&host, port).is_none());
    }

    #[tokio::test]
    async fn host_comparison_is_case_insensitive() {
        let pool = UpstreamPool::new(&settings(4, 30));
        let (listener, host, port) = local_origin().await;
        spawn_acceptor(listener);

        let conn = pool.connect(&host, port).await.unwrap();
        pool.checkin(conn, "LOCALHOST-Mixed.Example", port, true);

        assert!(pool.checkout("localhost-mixed.example", port).is_some());
    }

    #[tokio::test]
    async fn expired_connection_is_not_reused() {
        let pool = UpstreamPool::new(&settings(4, 1));
        let (listener, host, port) = local_origin().await;
        spawn_acceptor(listener);

        let conn = pool.connect(&host, port).await.unwrap();
        pool.checkin(conn, &host, port, true);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(pool.checkout(&host, port).is_none());
        let stats = pool.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn full_pool_drops_extra_returns() {
        let pool = UpstreamPool::new(&settings(1, 30));
        let (listener, host, port) = local_origin().await;
        spawn_acceptor(listener);

        let first = pool.connect(&host, port).await.unwrap();
        let second = pool.connect(&host, port).await.unwrap();

        pool.checkin(first, &host, port, true);
        pool.checkin(second, &host, port, true);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.dropped_full, 1);
    }

    #[tokio::test]
    async fn sweep_closes_only_stale_idle_slots() {
        let pool = UpstreamPool::new(&settings(4, 1));
        let (listener, host, port) = local_origin().await;
        spawn_acceptor(listener);

        let stale = pool.connect(&host, port).await.unwrap();
        pool.checkin(stale, &host, port, true);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let fresh = pool.connect(&host, port).await.unwrap();
        pool.checkin(fresh, &host, port, true);

        assert_eq!(pool.sweep_idle(), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn dial_timeout_is_reported() {
        let pool = UpstreamPool::new(&UpstreamSettings {
            capacity: 4,
            keep_alive_secs: 30,
            connect_timeout_ms: 100,
            recv_timeout_ms: 5000,
        });

        // RFC 5737 TEST-NET-1, non-routable.
        let result = pool.connect("192.0.2.1", 9999).await;
        assert!(result.is_err());
        if let Err(e) = result {
            assert_eq!(e.kind(), std::io::ErrorKind::TimedOut);
        }
    }
}
