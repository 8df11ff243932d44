//! C1 — per-provider connection pool (spec §4.1).
//!
//! Two-level admission: a local semaphore caps one provider's connections at
//! `max_connections`, a process-wide semaphore shared across every pool caps
//! the sum at `global_connection_cap`. Idle connections sit on a LIFO stack
//! so the most recently used (most likely still warm) connection is handed
//! out first. Background [`UsageType`]s must leave `reserved` local permits
//! free for streaming (spec §4.1's headroom rule).

mod connection;
mod reaper;

pub use connection::Lease;
pub use reaper::spawn_reaper;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::nntp::NntpConnection;
use crate::provider::{OperationContext, Provider};

/// Emitted on every admission/release/reap so operators can observe pool
/// health without polling (spec §4.1 "expose live/idle/max as an event
/// stream").
#[derive(Debug, Clone, Copy)]
pub struct PoolEvent {
    pub provider: &'static str,
    pub live: usize,
    pub idle: usize,
    pub max: usize,
}

struct IdleSlot {
    conn: NntpConnection,
    last_touched: Instant,
}

struct PoolInner {
    provider: Provider,
    max: usize,
    reserved: usize,
    idle: Mutex<Vec<IdleSlot>>,
    live: AtomicUsize,
    local: Arc<Semaphore>,
    global: Arc<Semaphore>,
    events: broadcast::Sender<PoolEvent>,
    name_static: &'static str,
}

/// One provider's bounded connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Build a pool for `provider`. `global` is the single process-wide
    /// semaphore every `Pool` in the process shares (spec §4.1's
    /// cross-pool cap).
    pub fn new(provider: Provider, global: Arc<Semaphore>) -> Self {
        let reserved = Config::background_reservation(provider.max_connections);
        let (tx, _rx) = broadcast::channel(64);
        // Leaked once per provider for the process lifetime; pool count is
        // bounded by configuration, not by request volume.
        let name_static: &'static str = Box::leak(provider.name.to_string().into_boxed_str());
        Pool {
            inner: Arc::new(PoolInner {
                max: provider.max_connections,
                reserved,
                idle: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                local: Arc::new(Semaphore::new(provider.max_connections)),
                global,
                events: tx,
                name_static,
                provider,
            }),
        }
    }

    pub fn provider(&self) -> &Provider {
        &self.inner.provider
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Acquire a connection, opening a new one if the idle stack is empty.
    /// Blocks (honouring `ctx.cancel`) until a permit is free, subject to
    /// the background-usage reservation and `deadline`.
    pub async fn acquire(&self, ctx: &OperationContext, deadline: Duration) -> Result<Lease> {
        if ctx.usage.is_background() && self.inner.local.available_permits() <= self.inner.reserved
        {
            return Err(CoreError::PoolExhausted {
                provider: self.inner.provider.name.to_string(),
            });
        }

        let local_permit = {
            let acquire = Arc::clone(&self.inner.local).acquire_owned();
            tokio::select! {
                res = timeout(deadline, acquire) => {
                    res.map_err(|_| CoreError::Timeout(deadline))?
                        .map_err(|_| CoreError::ConnectionFault("pool semaphore closed".into()))?
                }
                _ = ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
            }
        };

        let global_permit = {
            let acquire = Arc::clone(&self.inner.global).acquire_owned();
            tokio::select! {
                res = timeout(deadline, acquire) => {
                    res.map_err(|_| CoreError::Timeout(deadline))?
                        .map_err(|_| CoreError::ConnectionFault("global semaphore closed".into()))?
                }
                _ = ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
            }
        };

        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => {
                self.inner.live.fetch_add(1, Ordering::SeqCst);
                match NntpConnection::connect(&self.inner.provider).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.inner.live.fetch_sub(1, Ordering::SeqCst);
                        self.emit();
                        return Err(e);
                    }
                }
            }
        };

        self.emit();
        Ok(Lease::new(self.clone(), conn, local_permit, global_permit))
    }

    fn take_idle(&self) -> Option<NntpConnection> {
        self.inner.idle.lock().pop().map(|slot| slot.conn)
    }

    /// Return a connection to the idle stack (called by [`Lease::drop`]).
    fn release(&self, conn: NntpConnection) {
        self.inner.idle.lock().push(IdleSlot {
            conn,
            last_touched: Instant::now(),
        });
        self.emit();
    }

    /// Drop a connection instead of returning it to the idle stack (called
    /// when the lease holder observed a dead/faulty connection).
    fn destroy(&self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
        self.emit();
    }

    /// Force-release every connection matching `usage`, or every connection
    /// if `usage` is `None` (spec §4.1 "administrative force-release").
    /// Only idle connections can be force-released; in-flight leases drain
    /// naturally when their holder finishes.
    pub fn force_release_idle(&self) -> usize {
        let mut idle = self.inner.idle.lock();
        let n = idle.len();
        self.inner.live.fetch_sub(n, Ordering::SeqCst);
        idle.clear();
        drop(idle);
        self.emit();
        n
    }

    fn emit(&self) {
        let idle = self.inner.idle.lock().len();
        let _ = self.inner.events.send(PoolEvent {
            provider: self.inner.name_static,
            live: self.inner.live.load(Ordering::SeqCst),
            idle,
            max: self.inner.max,
        });
    }

    fn idle_timeout_sweep(&self, idle_timeout: Duration) {
        let mut idle = self.inner.idle.lock();
        let now = Instant::now();
        let before = idle.len();
        idle.retain(|slot| now.duration_since(slot.last_touched) < idle_timeout);
        let removed = before - idle.len();
        drop(idle);
        if removed > 0 {
            self.inner.live.fetch_sub(removed, Ordering::SeqCst);
            self.emit();
        }
    }
}

/// Permit pair a [`Lease`] releases on drop.
pub(crate) struct PermitPair {
    pub(crate) _local: OwnedSemaphorePermit,
    pub(crate) _global: OwnedSemaphorePermit,
}
