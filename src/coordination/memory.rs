//! In-process [`CoordinationStore`].
//!
//! Expiry is measured with [`tokio::time::Instant`], so tests running on a
//! paused runtime can age health markers with `tokio::time::advance`.  A
//! single `MemoryStore` shared through `Arc` behaves like one KeyDB instance
//! seen by several coordinators.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::time::Instant;

use super::store::CoordinationStore;

#[derive(Debug)]
enum Value {
    Marker,
    List(Vec<String>),
    Lock(String),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries))
    }

    /// Snapshot of a list's contents, mainly for assertions.
    pub fn list(&self, list: &str) -> Result<Vec<String>> {
        self.with_live(|entries| match entries.get(list) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => items.clone(),
            _ => Vec::new(),
        })
    }
}

fn matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_live(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Marker,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_live(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_live(|entries| {
            entries.remove(key);
        })
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.with_live(|entries| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|key| matches(pattern, key))
                .cloned()
                .collect();
            keys.sort();
            keys
        })
    }

    async fn list_push_if_absent(&self, list: &str, value: &str) -> Result<usize> {
        self.with_live(|entries| {
            let entry = entries.entry(list.to_string()).or_insert_with(|| Entry {
                value: Value::List(Vec::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(items) => match items.iter().position(|item| item == value) {
                    Some(index) => Ok(index),
                    None => {
                        items.push(value.to_string());
                        Ok(items.len() - 1)
                    }
                },
                _ => Err(anyhow!("WRONGTYPE {list} is not a list")),
            }
        })?
    }

    async fn list_index_of(&self, list: &str, value: &str) -> Result<Option<usize>> {
        self.with_live(|entries| match entries.get(list) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.iter().position(|item| item == value)),
            Some(_) => Err(anyhow!("WRONGTYPE {list} is not a list")),
            None => Ok(None),
        })?
    }

    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.with_live(|entries| {
            if entries.contains_key(name) {
                return false;
            }
            entries.insert(
                name.to_string(),
                Entry {
                    value: Value::Lock(owner.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        })
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<()> {
        self.with_live(|entries| {
            let owned = matches!(
                entries.get(name),
                Some(Entry { value: Value::Lock(holder), .. }) if holder == owner
            );
            if owned {
                entries.remove(name);
            }
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
