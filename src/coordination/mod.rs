//! Store-mediated coordination primitives.
//!
//! The fleet shares nothing but a KeyDB (Redis-compatible) instance: TTL
//! health markers prove liveness, an ordered list assigns ranks, and a named
//! lock serialises list mutations.  All of it is reached through the
//! [`store::CoordinationStore`] trait.

pub mod keyspace;
pub mod locks;
pub mod memory;
pub mod node;
pub mod redis;
pub mod store;

pub use keyspace::Keyspace;
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use store::CoordinationStore;
