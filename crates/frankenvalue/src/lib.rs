//! Per-context lazy values with lock-free cached reads.
//!
//! A [`ContextValue`] is a definition: a computation that yields one value per
//! [`Context`]. The first `get` against a context computes and publishes the
//! value; later reads find it in the context's small open-addressed cache
//! array without taking a lock.
//!
//! # Architecture
//!
//! - **Identity** (`identity`): unforgeable definition keys and Fibonacci slot hashes
//! - **Versions** (`version`): generation tokens; the live one is the only
//!   cross-thread visibility channel
//! - **Entries** (`entry`): weakly tagged values, promises and the tombstone
//! - **Cache array** (`cache`): home/backup probing, bounded placement and
//!   backfilling stale-entry eviction
//! - **Authoritative map** (`map`): the locked protocol that publishes,
//!   invalidates and replaces values, and resizes the cache array
//! - **Contexts** (`context`): caller data plus its lazily created map
//! - **Definitions** (`value`): public `get` / `remove` / `put`
//! - **Configuration** (`config`): cache tuning, overridable from the environment
//! - **Metrics** (`metrics`): atomic counters for observability
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//! use frankenvalue::{Context, ContextValue};
//!
//! let shout = ContextValue::from_fn(|name: &Context<&'static str>| {
//!     Ok::<_, Infallible>(name.to_uppercase())
//! });
//! let ctx = Context::new("hello");
//! assert_eq!(*shout.get(&ctx).unwrap(), "HELLO");
//!
//! shout.put(&ctx, String::from("override"));
//! assert_eq!(*shout.get(&ctx).unwrap(), "override");
//!
//! shout.remove(&ctx);
//! assert_eq!(*shout.get(&ctx).unwrap(), "HELLO");
//! ```

#![deny(unsafe_code)]

mod cache;
pub mod config;
pub mod context;
mod entry;
pub mod identity;
mod map;
pub mod metrics;
pub mod value;
mod version;

pub use cache::{CacheSnapshot, SlotView};
pub use config::{CacheConfig, ConfigError, cache_config};
pub use context::Context;
pub use entry::EntryState;
pub use identity::Identity;
pub use metrics::{MetricsSnapshot, StripedCounter, ValueMetrics, global_metrics};
pub use value::{ComputeValue, ContextValue, FnCompute};
