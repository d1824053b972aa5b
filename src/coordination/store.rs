//! The shared-store contract consumed by the coordinator.
//!
//! Everything the fleet knows about itself lives behind this trait: TTL
//! health markers, the ordered registration list, and a named lock guarding
//! list mutations.  [`crate::coordination::redis::RedisStore`] talks to
//! KeyDB/Redis; [`crate::coordination::memory::MemoryStore`] keeps the same
//! semantics in-process.

use std::time::Duration;

use anyhow::Result;

#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set `key` to a marker value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Refresh the expiration of an existing key.  Missing keys are ignored.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Delete a key of any type.  Missing keys are ignored.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Return every live key matching `pattern`.  Only a trailing `*` glob
    /// is required by callers.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Append `value` to `list` unless it is already present.  Returns the
    /// 0-based index of `value` in the list afterwards.
    async fn list_push_if_absent(&self, list: &str, value: &str) -> Result<usize>;

    /// Return the 0-based index of `value` in `list`, if present.
    async fn list_index_of(&self, list: &str, value: &str) -> Result<Option<usize>>;

    /// Try once to take the lock `name` for `owner`.  Returns `false` when
    /// another owner holds it.
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release `name` if it is still held by `owner`.
    async fn unlock(&self, name: &str, owner: &str) -> Result<()>;

    /// Round-trip liveness probe.
    async fn ping(&self) -> Result<()>;
}
