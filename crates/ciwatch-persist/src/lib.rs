//! Durable storage primitives shared by the ciwatch analysis core.
//!
//! The core treats persistence as a generic durable map (`KvStore`) plus a
//! monotonic sequence allocator. Two backends ship here: `SqliteKv` for
//! real deployments and `MemKv` for tests and ephemeral runs. `StringTable`
//! layers append-only string interning on top of either backend.

pub mod kv;
pub mod strings;

pub use kv::{KvStore, MemKv, SqliteKv, StoreError};
pub use strings::StringTable;
