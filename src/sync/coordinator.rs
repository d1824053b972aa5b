//! Leaderless rank assignment through the shared store.
//!
//! Every resync tick the coordinator refreshes its health marker, makes sure
//! it is registered in the shared list, counts live peers and derives its
//! offset from its rank.  When the live count shrinks (a peer died without
//! deregistering) the list is deleted and every survivor re-registers on
//! its next tick, which compacts positions back to `0..count`.
//!
//! Snapshots go out through a `watch` channel: a consumer that falls behind
//! only ever sees the latest instance, and the heartbeat never waits on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::instance::Instance;
use super::offset::compute_offset;
use crate::coordination::locks::{with_lock, LockSpec};
use crate::coordination::{node, CoordinationStore, Keyspace};
use crate::metrics::MetricsRegistry;
use crate::retry::{retry, ExponentialJitter, NoBackoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    #[default]
    None,
    /// Exponential backoff with jitter; seeded when `Some`.
    ExponentialJitter(Option<u64>),
}

/// Construction-time coordinator settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity override.  A generated `<hostname>-<suffix>` id otherwise.
    pub identity: Option<String>,
    /// Key prefix shared by the fleet.
    pub namespace: String,
    /// How often liveness and rank are re-checked.
    pub resync_frequency: Duration,
    /// Health-marker TTL; must exceed `resync_frequency`.
    pub health_expiration: Duration,
    /// TTL refreshed on the shared list on every ping.
    pub list_expiration: Duration,
    pub lock_ttl: Duration,
    pub lock_wait_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: BackoffKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            identity: None,
            namespace: "stagger".to_string(),
            resync_frequency: Duration::from_secs(2),
            health_expiration: Duration::from_secs(4),
            list_expiration: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(5),
            lock_wait_timeout: Duration::from_secs(2),
            retry_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            retry_backoff: BackoffKind::None,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.resync_frequency.is_zero(),
            "resync frequency must be positive"
        );
        ensure!(
            self.health_expiration > self.resync_frequency,
            "health expiration ({:?}) must exceed resync frequency ({:?})",
            self.health_expiration,
            self.resync_frequency
        );
        ensure!(!self.namespace.is_empty(), "namespace must not be empty");
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        let backoff: Box<dyn crate::retry::Backoff> = match self.retry_backoff {
            BackoffKind::None => Box::new(NoBackoff),
            BackoffKind::ExponentialJitter(Some(seed)) => Box::new(ExponentialJitter::seeded(seed)),
            BackoffKind::ExponentialJitter(None) => Box::new(ExponentialJitter::from_entropy()),
        };
        RetryPolicy::new(self.retry_attempts, backoff)
    }
}

#[derive(Debug)]
struct State {
    instance: Instance,
    last_count: i64,
}

/// Read-only view of a coordinator's latest [`Instance`].
#[derive(Clone)]
pub struct SnapshotHandle {
    state: Arc<Mutex<State>>,
}

impl SnapshotHandle {
    pub fn get(&self) -> Instance {
        lock_state(&self.state).instance.clone()
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // A panicking tick never leaves a half-written instance behind: every
    // field is assigned in one critical section without awaiting.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiving end of a running resync loop.
pub struct SyncStream {
    pub instances: watch::Receiver<Option<Instance>>,
    pub task: JoinHandle<Result<()>>,
}

impl SyncStream {
    /// Wait for the next emitted instance.  Snapshots emitted while the
    /// caller was busy collapse into the latest one.  `None` once the loop
    /// has ended.
    pub async fn recv(&mut self) -> Option<Instance> {
        loop {
            self.instances.changed().await.ok()?;
            if let Some(instance) = self.instances.borrow_and_update().clone() {
                return Some(instance);
            }
        }
    }

    /// Wait for the resync loop to end and return its outcome.
    pub async fn finish(self) -> Result<()> {
        drop(self.instances);
        self.task
            .await
            .map_err(|e| anyhow!("resync task failed: {e}"))?
    }
}

/// How one run of the resync loop ended without exhausting the budget.
enum LoopExit {
    /// Cancelled, or the stream was dropped.
    Stopped,
    /// Failed after at least one good tick.  The failure budget starts over.
    Interrupted(anyhow::Error),
}

pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
    keyspace: Keyspace,
    health_key: String,
    config: SyncConfig,
    list_lock: LockSpec,
    state: Arc<Mutex<State>>,
    metrics: MetricsRegistry,
}

impl Coordinator {
    /// Build a coordinator.  Does not touch the store.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        cadence: Duration,
        config: SyncConfig,
    ) -> Result<Self> {
        ensure!(!cadence.is_zero(), "cadence must be positive");
        config.validate()?;

        let keyspace = Keyspace::new(&config.namespace);
        let identity = config.identity.clone().unwrap_or_else(node::node_id);
        let health_key = keyspace.health_key(&identity);

        let list_lock = LockSpec {
            name: keyspace.list_lock().to_string(),
            owner: identity,
            ttl: config.lock_ttl,
            wait_timeout: config.lock_wait_timeout,
        };

        Ok(Self {
            store,
            state: Arc::new(Mutex::new(State {
                instance: Instance::new(health_key.clone(), cadence),
                last_count: 0,
            })),
            keyspace,
            health_key,
            config,
            list_lock,
            metrics: MetricsRegistry::new(),
        })
    }

    /// Report into `metrics` instead of a private registry.
    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> &str {
        &self.health_key
    }

    pub fn snapshot(&self) -> Instance {
        lock_state(&self.state).instance.clone()
    }

    pub fn snapshot_handle(&self) -> SnapshotHandle {
        SnapshotHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Start the resync loop and return the stream of [`Instance`]
    /// snapshots.  Cancelling `cancel` stops the loop and closes the stream.
    ///
    /// Store errors tear the loop down and restart it from a clean slate.
    /// Only consecutive failures count against the configured attempts: a
    /// run that completed a tick before failing starts a fresh budget.  Once
    /// the budget is exhausted the task ends with the last error.
    pub fn sync(self, cancel: CancellationToken) -> SyncStream {
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let this = Arc::new(self);

        let task = tokio::spawn(async move {
            loop {
                let result = retry(this.config.retry_policy(), |attempt| {
                    let this = Arc::clone(&this);
                    let tx = Arc::clone(&tx);
                    let cancel = cancel.clone();
                    async move {
                        if attempt > 1 {
                            info!(attempt, id = %this.health_key, "restarting resync loop");
                        }
                        this.run_loop(&tx, &cancel).await.inspect_err(|_| {
                            this.metrics.metrics.resync_failures.inc();
                        })
                    }
                })
                .await;

                match result {
                    Ok(LoopExit::Stopped) => {
                        info!(id = %this.health_key, "resync loop stopped");
                        return Ok(());
                    }
                    Ok(LoopExit::Interrupted(e)) => {
                        this.metrics.metrics.resync_failures.inc();
                        warn!(
                            id = %this.health_key,
                            error = %format!("{e:#}"),
                            "resync loop failed after progress, restarting"
                        );
                    }
                    Err(e) => {
                        error!(id = %this.health_key, error = %e, "resync loop gave up");
                        return Err(e.into());
                    }
                }
            }
        });

        SyncStream {
            instances: rx,
            task,
        }
    }

    async fn run_loop(
        self: &Arc<Self>,
        tx: &watch::Sender<Option<Instance>>,
        cancel: &CancellationToken,
    ) -> Result<LoopExit> {
        self.cleanup().await?;

        let mut progressed = false;
        match self.run_ticks(tx, cancel, &mut progressed).await {
            Ok(()) => Ok(LoopExit::Stopped),
            Err(e) if progressed => Ok(LoopExit::Interrupted(e)),
            Err(e) => Err(e),
        }
    }

    async fn run_ticks(
        self: &Arc<Self>,
        tx: &watch::Sender<Option<Instance>>,
        cancel: &CancellationToken,
        progressed: &mut bool,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.resync_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            // Each tick runs as its own task so a panic is contained to it.
            let this = Arc::clone(self);
            let instance = match tokio::spawn(async move { this.tick().await }).await {
                Ok(Ok(instance)) => instance,
                Ok(Err(e)) => return Err(e),
                Err(e) if e.is_panic() => {
                    error!(id = %self.health_key, error = %e, "resync tick panicked");
                    self.metrics.metrics.resync_panics.inc();
                    continue;
                }
                Err(e) => return Err(anyhow!("resync tick cancelled: {e}")),
            };

            *progressed = true;

            if tx.send(Some(instance)).is_err() {
                debug!(id = %self.health_key, "instance stream dropped, stopping");
                return Ok(());
            }
        }
    }

    /// Remove this instance's stale health marker and forget any previous
    /// rank before a (re)started loop.
    async fn cleanup(&self) -> Result<()> {
        self.store
            .delete(&self.health_key)
            .await
            .context("failed to delete stale health marker")?;

        let mut state = lock_state(&self.state);
        state.instance.position = -1;
        state.instance.count = 0;
        state.instance.offset = None;
        state.last_count = 0;
        Ok(())
    }

    /// One resync pass: ping, register, count, detect shrinkage, compute the
    /// offset.  Returns the snapshot to emit.
    #[instrument(skip(self), fields(id = %self.health_key))]
    pub async fn tick(&self) -> Result<Instance> {
        self.ping().await?;
        let position = self.register().await?;
        let count = self.count().await?;

        let last_count = lock_state(&self.state).last_count;
        let shrunk = count < last_count && last_count != 0;
        if shrunk {
            self.unregister_all(count, last_count).await?;
        }

        let cadence_secs = i64::try_from(self.cadence().as_secs()).unwrap_or(i64::MAX);
        let (snapshot, changed) = {
            let mut state = lock_state(&self.state);
            let before = state.instance.clone();
            state.last_count = count;
            state.instance.count = count;
            // After a reset the rank read this tick is already stale; keep
            // the previous position and offset until re-registration.
            if !shrunk {
                state.instance.position = position;
                let secs = compute_offset(cadence_secs, count, position);
                state.instance.offset = Some(Duration::from_secs(secs.max(0) as u64));
            }
            (state.instance.clone(), state.instance != before)
        };

        let m = &self.metrics.metrics;
        m.resync_ticks.inc();
        m.live_instances.set(snapshot.count);
        m.instance_position.set(snapshot.position);
        m.offset_seconds
            .set(snapshot.offset.map_or(0, |o| o.as_secs() as i64));

        let offset_secs = snapshot.offset.map(|o| o.as_secs());
        if changed {
            info!(
                position = snapshot.position,
                count = snapshot.count,
                ?offset_secs,
                "instance updated"
            );
        } else {
            debug!(
                position = snapshot.position,
                count = snapshot.count,
                ?offset_secs,
                "instance unchanged"
            );
        }

        Ok(snapshot)
    }

    fn cadence(&self) -> Duration {
        lock_state(&self.state).instance.cadence
    }

    /// Place the health marker and refresh the shared list's expiration.
    async fn ping(&self) -> Result<()> {
        self.store
            .set_with_ttl(&self.health_key, self.config.health_expiration)
            .await
            .context("failed to perform health check for this instance")?;
        self.store
            .expire(self.keyspace.instance_list(), self.config.list_expiration)
            .await
            .context("failed to reset list expiration")?;
        Ok(())
    }

    /// Append this instance to the shared list if absent and return its
    /// index.
    async fn register(&self) -> Result<i64> {
        let store = self.store.as_ref();
        let list = self.keyspace.instance_list();
        let index = with_lock(store, &self.list_lock, || async {
            let existing = store
                .list_index_of(list, &self.health_key)
                .await
                .context("failed to read position in list")?;
            match existing {
                Some(index) => Ok(index),
                None => store
                    .list_push_if_absent(list, &self.health_key)
                    .await
                    .context("failed to claim position in list"),
            }
        })
        .await?;
        i64::try_from(index).context("list index out of range")
    }

    /// Number of live health markers in the namespace.
    async fn count(&self) -> Result<i64> {
        let keys = self
            .store
            .keys(&self.keyspace.health_pattern())
            .await
            .context("failed to get number of instances")?;
        Ok(keys.len() as i64)
    }

    /// Delete the shared list so every live instance re-registers with a
    /// contiguous position.  Health markers are left alone.
    async fn unregister_all(&self, count: i64, last_count: i64) -> Result<()> {
        let store = self.store.as_ref();
        let list = self.keyspace.instance_list();
        with_lock(store, &self.list_lock, || async {
            store.delete(list).await.context("failed to delete instance list")
        })
        .await?;

        self.metrics.metrics.rebalances.inc();
        warn!(
            id = %self.health_key,
            count,
            last_count,
            "live instances shrank, instance list reset"
        );
        Ok(())
    }
}
