//! Storage backend implementations.
//!
//! Backends implement [`StorageBackend`](crate::interfaces::StorageBackend).
//! Available implementations:
//! - `memory`: RAM disk for tests and standalone targets

mod memory;

pub use memory::MemoryBackend;
