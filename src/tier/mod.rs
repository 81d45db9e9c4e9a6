//! Cache tiers.
//!
//! Three layers with distinct latency/durability tradeoffs:
//!
//! - [`memory::MemoryTier`] (L1) — in-process, LRU under a byte budget
//! - [`remote::RemoteTier`] (L2) — optional shared KV store over the
//!   network, TTL-expired, degrades silently
//! - [`durable::DurableTier`] (L3) — filesystem blobs with metadata
//!   sidecars, never expires on its own
//!
//! Expiry semantics are deliberately per-tier (L1 evicts by budget, L2
//! by TTL, L3 only on explicit purge): the tiers are eventually
//! consistent and no cross-tier invalidation is propagated.

use std::future::Future;
use std::pin::Pin;

pub mod durable;
pub mod memory;
pub mod remote;

/// Boxed future used by dyn-compatible async traits
/// ([`remote::RemoteStore`], [`crate::scheduler::Renderer`]).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
