//! Fixed-size pool of directory connections: a counting semaphore admits
//! users, per-connection mutexes hand out exclusive handles, and a small
//! state machine rebinds handles that went away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::{AuthMethod, Config};
use crate::error::Result;
use crate::ldap::{DirBackend, DirConn};

/// Pool waits are a generous multiple of the query timeout; hitting it
/// means every connection stayed busy for that long.
const ACQUIRE_TIMEOUT_MUL: u32 = 10;

/// Seconds until the next bind attempt after `tries` failures; the last
/// step never fires on its own and is capped by `reconnect_interval`.
const BACKOFF: [u64; 4] = [2, 5, 20, u64::MAX];

/// Serializes Kerberos credential acquisition across the process.
static KRB5_LOCK: Mutex<()> = Mutex::const_new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    /// Fresh slot, never bound.
    Never,
    /// A bind is in flight on this slot.
    Binding,
    Bound,
    /// Last bind failed; retry gated by the backoff window.
    Failed,
}

pub struct ConnSlot {
    index: usize,
    conn: Option<Box<dyn DirConn>>,
    state: BindState,
    tries: u32,
    next_reconnect: Instant,
}

impl std::fmt::Debug for ConnSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnSlot")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("tries", &self.tries)
            .field("next_reconnect", &self.next_reconnect)
            .finish()
    }
}

impl ConnSlot {
    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn conn(&mut self) -> Result<&mut (dyn DirConn + 'static)> {
        if self.state != BindState::Bound {
            return Err(error!(NotConnected => "connection #{} is not bound", self.index));
        }
        self.conn
            .as_deref_mut()
            .ok_or_else(|| error!(NotConnected => "connection #{} has no handle", self.index))
    }

    /// Flags the slot after an operation reported the server gone, so the
    /// next acquirer rebinds it.
    pub fn mark_disconnected(&mut self) {
        self.state = BindState::Failed;
        self.next_reconnect = Instant::now();
        self.conn = None;
    }
}

pub struct ConnPool {
    config: Arc<Config>,
    backend: Arc<dyn DirBackend>,
    sem: Semaphore,
    slots: Vec<Mutex<ConnSlot>>,
}

/// Exclusive use of one pooled connection; dropping it releases both the
/// slot mutex and the semaphore.
#[derive(Debug)]
pub struct PooledConn<'a> {
    _permit: SemaphorePermit<'a>,
    pub slot: MutexGuard<'a, ConnSlot>,
}

impl ConnPool {
    pub fn new(config: Arc<Config>, backend: Arc<dyn DirBackend>) -> Arc<ConnPool> {
        let count = config.connections.max(2) as usize;
        let slots = (0..count)
            .map(|index| {
                Mutex::new(ConnSlot {
                    index,
                    conn: None,
                    state: BindState::Never,
                    tries: 0,
                    next_reconnect: Instant::now(),
                })
            })
            .collect();
        Arc::new(ConnPool {
            config,
            backend,
            sem: Semaphore::new(count),
            slots,
        })
    }

    /// Waits for a free connection and returns it bound. A handle lost
    /// since its last use forces a synchronous rebind on the acquirer.
    pub async fn acquire(&self) -> Result<PooledConn<'_>> {
        let wait = Duration::from_secs(self.config.timeout) * ACQUIRE_TIMEOUT_MUL;
        let permit = tokio::time::timeout(wait, self.sem.acquire())
            .await
            .map_err(|_| {
                log::error!(
                    target: "pool",
                    "no free directory connection after {}s; \
                     consider raising 'connections' ({} now)",
                    wait.as_secs(),
                    self.config.connections
                );
                error!(Timeout => "no free directory connection")
            })?
            .expect("pool semaphore never closes");

        let mut slot = None;
        for candidate in &self.slots {
            if let Ok(guard) = candidate.try_lock() {
                slot = Some(guard);
                break;
            }
        }
        // The permit guarantees a free mutex exists.
        let mut slot = slot.expect("semaphore permit without a free connection");

        self.ensure_bound(&mut slot, false).await?;
        Ok(PooledConn {
            _permit: permit,
            slot,
        })
    }

    /// Drives the slot's state machine until it is `Bound` or the attempt
    /// fails. `force` overrides the backoff window.
    pub async fn ensure_bound(&self, slot: &mut ConnSlot, force: bool) -> Result<()> {
        if slot.state == BindState::Bound && slot.conn.is_some() {
            return Ok(());
        }

        if slot.state == BindState::Failed && !force {
            let now = Instant::now();
            if now < slot.next_reconnect {
                return Err(error!(SoftQuota =>
                    "connection #{} retries in {}s",
                    slot.index,
                    (slot.next_reconnect - now).as_secs()
                ));
            }
        }

        slot.state = BindState::Binding;
        match self.bind_slot(slot).await {
            Ok(()) => {
                slot.state = BindState::Bound;
                slot.tries = 0;
                log::info!(target: "pool", "connection #{} bound", slot.index);
                Ok(())
            }
            Err(e) => {
                slot.state = BindState::Failed;
                let step = BACKOFF[slot.tries.min(3) as usize];
                let delay = Duration::from_secs(step.min(self.config.reconnect_interval));
                slot.tries = slot.tries.saturating_add(1);
                slot.next_reconnect = Instant::now() + delay;
                log::error!(
                    target: "pool",
                    "bind of connection #{} failed ({}); next attempt in {}s",
                    slot.index,
                    e,
                    delay.as_secs()
                );
                Err(e)
            }
        }
    }

    async fn bind_slot(&self, slot: &mut ConnSlot) -> Result<()> {
        if slot.conn.is_none() {
            slot.conn = Some(self.backend.connect(&self.config).await?);
        }
        let conn = slot.conn.as_deref_mut().expect("just connected");

        let outcome = match self.config.auth_method {
            AuthMethod::Sasl => {
                // Credential acquisition must not race across the process.
                let _krb5 = KRB5_LOCK.lock().await;
                conn.bind(&self.config).await
            }
            _ => conn.bind(&self.config).await,
        };

        if let Err(e) = &outcome {
            if e.is(crate::error::ErrorKind::NoPerm)
                && self.config.auth_method != AuthMethod::None
            {
                // Invalid credentials: fall back to an anonymous bind so
                // the instance can at least read public data.
                log::warn!(
                    target: "pool",
                    "credentials rejected on connection #{}; retrying anonymously",
                    slot.index
                );
                let mut anonymous = (*self.config).clone();
                anonymous.auth_method = AuthMethod::None;
                return conn.bind(&anonymous).await;
            }
            slot.conn = None;
        }
        outcome
    }

    /// Current backoff window start for tests and diagnostics.
    pub fn backoff_delay(&self, tries: u32) -> Duration {
        Duration::from_secs(BACKOFF[tries.min(3) as usize].min(self.config.reconnect_interval))
    }
}
