//! Connection pool keyed by execution context.
//!
//! One host connection is kept per [`ContextKey`]. A connection is reused
//! while it keeps being used within the idle window and answers probes;
//! otherwise it is closed and replaced. An entry whose session could not be
//! resolved is marked unhealthy and goes on the next eviction pass.
//! Connections with outstanding leases are never evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pane_mcp_core::{ContextKey, Error, Result, SessionHandle};
use pane_mcp_host::{HostConnection, TerminalHost};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RETRY_DELAY: Duration = Duration::from_millis(200);

/// A live connection held by the pool.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    /// Identifier of the underlying host connection
    pub connection_id: Uuid,
    /// When the connection was opened
    pub created_at: DateTime<Utc>,
    /// The connection itself
    pub connection: Arc<dyn HostConnection>,
    /// Session resolved on the most recent acquire
    pub handle: SessionHandle,
}

impl PooledConnection {
    fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.handle.estimated_bytes()
    }
}

#[derive(Debug)]
struct Slot {
    entry: tokio::sync::Mutex<Option<PooledConnection>>,
    leases: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self {
            entry: tokio::sync::Mutex::new(None),
            leases: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    fn is_expired(&self, now: Instant, idle_window: Duration) -> bool {
        now.saturating_duration_since(*lock(&self.last_used)) >= idle_window
    }

    fn in_use(&self) -> bool {
        self.leases.load(Ordering::SeqCst) > 0
    }
}

/// Counted reference to a slot; releases the count on drop.
#[derive(Debug)]
struct SlotRef(Arc<Slot>);

impl SlotRef {
    fn new(slot: Arc<Slot>) -> Self {
        slot.leases.fetch_add(1, Ordering::SeqCst);
        Self(slot)
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        self.0.touch();
        self.0.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Borrowed use of a pooled connection. Dropping it returns the connection.
#[derive(Debug)]
pub struct ConnectionLease {
    _slot: SlotRef,
    context: ContextKey,
    pooled: PooledConnection,
}

impl ConnectionLease {
    /// The host connection.
    pub fn connection(&self) -> &dyn HostConnection {
        self.pooled.connection.as_ref()
    }

    /// The session this lease resolved to.
    pub fn handle(&self) -> &SessionHandle {
        &self.pooled.handle
    }

    /// Identifier of the underlying connection.
    pub fn connection_id(&self) -> Uuid {
        self.pooled.connection_id
    }

    /// When the underlying connection was opened.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.pooled.created_at
    }

    /// The context this lease was acquired for.
    pub fn context(&self) -> &ContextKey {
        &self.context
    }
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections held
    pub pooled: usize,
    /// Connections with outstanding leases
    pub in_use: usize,
    /// Rough size of the bookkeeping
    pub estimated_bytes: usize,
}

/// Context-keyed pool of host connections.
pub struct ConnectionPool {
    host: Arc<dyn TerminalHost>,
    idle_window: Duration,
    slots: Mutex<HashMap<ContextKey, Arc<Slot>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host.name())
            .field("idle_window", &self.idle_window)
            .field("contexts", &lock(&self.slots).len())
            .finish()
    }
}

impl ConnectionPool {
    /// Create an empty pool for `host`.
    pub fn new(host: Arc<dyn TerminalHost>, idle_window: Duration) -> Self {
        Self {
            host,
            idle_window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the host backend.
    pub fn host_name(&self) -> &'static str {
        self.host.name()
    }

    /// Lease a connection for `context`, reusing a healthy one when possible.
    ///
    /// The session is resolved on every acquire. An unknown session id fails
    /// with `SessionNotFound` and leaves the entry pooled but unhealthy.
    pub async fn acquire(&self, context: ContextKey) -> Result<ConnectionLease> {
        self.evict_expired().await;

        let slot_ref = {
            let mut slots = lock(&self.slots);
            let slot = slots
                .entry(context.clone())
                .or_insert_with(|| Arc::new(Slot::new()));
            SlotRef::new(Arc::clone(slot))
        };

        let mut entry = slot_ref.0.entry.lock().await;

        if let Some(pooled) = entry.take() {
            if slot_ref.0.is_expired(Instant::now(), self.idle_window) {
                debug!(
                    "Connection {} for {} outlived the idle window",
                    pooled.connection_id, context
                );
                pooled.connection.close().await;
            } else if let Err(e) = pooled.connection.probe().await {
                warn!(
                    "Connection {} for {} failed its probe: {}",
                    pooled.connection_id, context, e
                );
                pooled.connection.close().await;
            } else {
                *entry = Some(pooled);
            }
        }

        let mut pooled = match entry.take() {
            Some(pooled) => pooled,
            None => {
                let connection = self.connect().await?;
                info!(
                    "Opened {} connection {} for {}",
                    self.host.name(),
                    connection.id(),
                    context
                );
                PooledConnection {
                    connection_id: connection.id(),
                    created_at: Utc::now(),
                    handle: SessionHandle::new("", "", ""),
                    connection,
                }
            }
        };

        let resolved = match &context {
            ContextKey::Active => pooled.connection.current_session().await,
            ContextKey::Session(id) => pooled.connection.resolve_session(id).await,
        };
        match resolved {
            Ok(mut handle) => {
                handle.touch();
                pooled.handle = handle;
            }
            Err(e) => {
                pooled.handle.mark_unhealthy();
                *entry = Some(pooled);
                return Err(e);
            }
        }

        *entry = Some(pooled.clone());
        slot_ref.0.touch();
        drop(entry);

        Ok(ConnectionLease {
            _slot: slot_ref,
            context,
            pooled,
        })
    }

    /// Return a lease. Equivalent to dropping it.
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    /// Close idle connections past the idle window, and those whose session
    /// went away. Returns how many were closed.
    pub async fn evict_expired(&self) -> usize {
        self.evict(false).await
    }

    /// Close every connection without an outstanding lease, expired or not.
    /// Returns how many were closed.
    pub async fn force_cleanup(&self) -> usize {
        self.evict(true).await
    }

    async fn evict(&self, force: bool) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut slots = lock(&self.slots);
            slots.retain(|_, slot| {
                if slot.in_use() {
                    return true;
                }
                let Ok(mut entry) = slot.entry.try_lock() else {
                    return true;
                };
                let unhealthy = entry
                    .as_ref()
                    .is_some_and(|pooled| !pooled.handle.is_healthy);
                if force || unhealthy || slot.is_expired(now, self.idle_window) {
                    evicted.extend(entry.take());
                    false
                } else {
                    true
                }
            });
        }

        for pooled in &evicted {
            debug!("Closing pooled connection {}", pooled.connection_id);
            pooled.connection.close().await;
        }
        if !evicted.is_empty() {
            info!("Evicted {} pooled connection(s)", evicted.len());
        }
        evicted.len()
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let slots = lock(&self.slots);
        let mut stats = PoolStats::default();
        for (context, slot) in slots.iter() {
            stats.estimated_bytes += std::mem::size_of::<Slot>() + context_bytes(context);
            match slot.entry.try_lock() {
                Ok(entry) => {
                    if let Some(pooled) = entry.as_ref() {
                        stats.pooled += 1;
                        stats.estimated_bytes += pooled.estimated_bytes();
                    }
                }
                // Being acquired right now
                Err(_) => stats.pooled += 1,
            }
            if slot.in_use() {
                stats.in_use += 1;
            }
        }
        stats
    }

    async fn connect(&self) -> Result<Arc<dyn HostConnection>> {
        match self.host.connect().await {
            Ok(connection) => Ok(connection),
            Err(first) => {
                warn!(
                    "Connecting to {} failed, retrying once: {}",
                    self.host.name(),
                    first
                );
                tokio::time::sleep(RETRY_DELAY).await;
                self.host.connect().await.map_err(|e| {
                    Error::Connection(format!(
                        "{} host unreachable after retry: {}",
                        self.host.name(),
                        e
                    ))
                })
            }
        }
    }
}

fn context_bytes(context: &ContextKey) -> usize {
    match context {
        ContextKey::Active => 0,
        ContextKey::Session(id) => id.len(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
