//! Lock-free concurrent collections: a hash table, a FIFO queue, and the set
//! and producer-consumer adapters built on them.
//!
//! # Key Features
//!
//! - Open-addressed, linearly-probed hash table with lazy tombstones and
//!   incremental resize-by-copy; no table-wide lock is ever held.
//! - Michael-Scott lock-free FIFO queue with bulk enqueue and atomic drain.
//! - `Set<T>` and grouped/unique producer-consumer adapters built on the same
//!   primitives.
//! - Epoch-based reclamation ([`epoch`]) for the tables, nodes, and slot
//!   payloads that a garbage-collected host would reclaim for free.
//!
//! # Example
//!
//! ```
//! use lockfree_collections::Dictionary;
//!
//! let dict: Dictionary<&str, i64> = Dictionary::new();
//! dict.try_add("requests", 0).unwrap();
//! assert_eq!(dict.increment("requests"), 1);
//! assert_eq!(dict.get(&"requests"), Some(1));
//! ```

mod backoff;
mod config;
mod counter;
mod dictionary;
mod epoch;
mod error;
mod filter;
mod invariants;
mod iterators;
mod metrics;
mod producer_consumer;
mod queue;
mod set;
mod table;

pub use backoff::Backoff;
pub use config::{Config, MAX_CAPACITY};
pub use counter::Counter;
pub use dictionary::{Dictionary, Iter};
pub use error::Error;
pub use iterators::{FilterAdd, RemoveWhere};
pub use metrics::{Metrics, MetricsSnapshot};
pub use producer_consumer::{GroupedProducerConsumer, UniqueElementProducerConsumer};
pub use queue::{Batch, DequeueAll, Queue};
pub use set::Set;
