use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use super::store::CoordinationStore;

/// Name, owner and timing of one distributed lock.
#[derive(Debug, Clone)]
pub struct LockSpec {
    pub name: String,
    pub owner: String,
    /// Lock TTL; bounds how long a crashed holder can block the fleet.
    pub ttl: Duration,
    /// How long [`acquire_lock`] polls before giving up.
    pub wait_timeout: Duration,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Acquire the lock, polling until `spec.wait_timeout` elapses.
///
/// Returns an error if the lock is still held by another owner at the
/// deadline.
pub async fn acquire_lock(store: &dyn CoordinationStore, spec: &LockSpec) -> Result<()> {
    let deadline = tokio::time::Instant::now() + spec.wait_timeout;

    loop {
        if store.try_lock(&spec.name, &spec.owner, spec.ttl).await? {
            debug!(lock = %spec.name, owner = %spec.owner, "lock acquired");
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
    }

    warn!(lock = %spec.name, timeout = ?spec.wait_timeout, "timed out waiting for lock");
    bail!("timed out acquiring lock {}", spec.name)
}

/// Release the lock if it is still owned by `spec.owner`.
pub async fn release_lock(store: &dyn CoordinationStore, spec: &LockSpec) -> Result<()> {
    store.unlock(&spec.name, &spec.owner).await?;
    debug!(lock = %spec.name, owner = %spec.owner, "lock released");
    Ok(())
}

/// Run `f` while holding the lock.  The lock is released whether or not `f`
/// succeeds; a release failure is logged, and only reported when `f` itself
/// succeeded.
pub async fn with_lock<T, F, Fut>(store: &dyn CoordinationStore, spec: &LockSpec, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    acquire_lock(store, spec).await?;

    let result = f().await;

    // Always release the lock.
    let released = release_lock(store, spec).await;
    if let Err(ref e) = released {
        warn!(lock = %spec.name, error = %e, "failed to release lock");
    }

    let value = result?;
    released.map(|()| value)
}
