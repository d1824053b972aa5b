//! Leaderless staggered scheduling over a shared KeyDB / Redis keyspace.
//!
//! Every process running the same job registers a health marker and a slot
//! in a shared instance list.  From its rank among live peers each process
//! derives an offset inside the cadence window and runs its action on that
//! phase, so N processes spread their work evenly without electing a leader.

pub mod action;
pub mod config;
pub mod coordination;
pub mod http;
pub mod metrics;
pub mod retry;
pub mod sync;
