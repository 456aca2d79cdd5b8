//! The persistent change stream: a reserved connection feeding entry
//! events into the dispatcher, and the barrier that holds zone
//! publication back until the initial refresh pass has drained.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::Result;
use crate::instance::Instance;
use crate::ldap::{DirConn, SyncEvent, SYNC_FILTER};
use crate::{dispatch, fs, projector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Initial refresh still streaming; zones stay unpublished.
    Init,
    /// Live streaming; changes apply immediately.
    Finished,
}

/// Gate between the initial refresh and live operation.
pub struct SyncBarrier {
    finished: AtomicBool,
    pending: AtomicUsize,
    notify: Notify,
}

impl SyncBarrier {
    pub fn new() -> Arc<SyncBarrier> {
        Arc::new(SyncBarrier {
            finished: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn state(&self) -> SyncState {
        if self.finished.load(Ordering::SeqCst) {
            SyncState::Finished
        } else {
            SyncState::Init
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state() == SyncState::Finished
    }

    /// Back to `Init`; used when the stream has to restart from scratch.
    pub fn reset(&self) {
        self.finished.store(false, Ordering::SeqCst);
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Tracks one dispatched task during `Init`. Returns `None` once live;
    /// live changes are not barriered.
    pub fn track(self: &Arc<Self>) -> Option<TrackedTask> {
        if self.is_finished() {
            return None;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        Some(TrackedTask(self.clone()))
    }

    /// Waits until every tracked task has completed.
    pub async fn wait_drain(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Completion token held by a dispatched task while the barrier is up.
pub struct TrackedTask(Arc<SyncBarrier>);

impl Drop for TrackedTask {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

/// Runs the change stream until shutdown. Every exit path other than
/// `Shutdown` loops back into a reconnect.
pub async fn consumer_run(instance: Arc<Instance>) -> Result<()> {
    loop {
        instance.check_exiting()?;
        instance.barrier.reset();

        // Half-written zone files from the previous stream are stale now;
        // projection rebuilds them.
        if let Err(e) = fs::sweep_stale_files(&instance.data_dir(), &instance.register.origins())
        {
            log::warn!(target: "sync", "stale zone file sweep failed: {}", e);
        }

        let mut conn = connect_stream(&instance).await?;
        if let Err(e) = conn.sync_open(&instance.config.base, SYNC_FILTER).await {
            log::error!(target: "sync", "cannot open persistent search: {}", e);
            continue;
        }
        log::info!(
            target: "sync",
            "persistent search open at '{}'",
            instance.config.base
        );

        match stream_loop(&instance, conn.as_mut()).await {
            Err(e) if e.is(crate::error::ErrorKind::Shutdown) => return Err(e),
            Err(e) => {
                if !e.is_connection() {
                    instance.taint(&format!("stream failed unexpectedly: {}", e));
                }
                log::error!(target: "sync", "stream lost ({}); reconnecting", e);
            }
            Ok(()) => unreachable!("the stream loop only returns through errors"),
        }
    }
}

/// Binds the consumer's reserved connection, backing off between attempts
/// and honoring shutdown at every wait.
async fn connect_stream(instance: &Arc<Instance>) -> Result<Box<dyn DirConn>> {
    let mut tries = 0u32;
    loop {
        instance.check_exiting()?;

        match instance.backend.connect(&instance.config).await {
            Ok(mut conn) => match conn.bind(&instance.config).await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    log::error!(target: "sync", "stream bind failed: {}", e)
                }
            },
            Err(e) => log::error!(target: "sync", "stream connect failed: {}", e),
        }

        let delay = instance.pool.backoff_delay(tries);
        tries = tries.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = instance.wake.notified() => {}
        }
    }
}

async fn stream_loop(instance: &Arc<Instance>, conn: &mut dyn DirConn) -> Result<()> {
    loop {
        let event = tokio::select! {
            event = conn.sync_recv() => event?,
            _ = instance.wake.notified() => {
                return Err(error!(Shutdown => "stream interrupted"));
            }
        };

        match event {
            SyncEvent::Entry { change, entry } => {
                // The cap keeps a burst of events from swamping the task
                // queues; the permit travels with the dispatched job.
                let permit = tokio::select! {
                    permit = instance.dispatch_sem.clone().acquire_owned() => {
                        permit.expect("dispatch semaphore never closes")
                    }
                    _ = instance.wake.notified() => {
                        return Err(error!(Shutdown => "stream interrupted"));
                    }
                };
                dispatch::dispatch_event(instance, change, entry, permit);
            }
            SyncEvent::RefreshDone => {
                log::info!(
                    target: "sync",
                    "initial refresh complete; {} tasks to drain",
                    instance.barrier.pending()
                );
                tokio::select! {
                    _ = instance.barrier.wait_drain() => {}
                    _ = instance.wake.notified() => {
                        return Err(error!(Shutdown => "stream interrupted"));
                    }
                }
                instance.barrier.finish();
                if let Err(e) = projector::publish_pending(instance).await {
                    log::error!(target: "sync", "deferred zone publication failed: {}", e);
                }
                log::info!(target: "sync", "instance '{}' is live", instance.name());
            }
            SyncEvent::Reference => {
                log::warn!(target: "sync", "search reference ignored (not supported)");
            }
        }
    }
}
