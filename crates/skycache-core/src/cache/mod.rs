//! Local storage for offline content.
//!
//! This module provides:
//! - `is_cacheable`: which network responses may be persisted
//! - `CacheStorage`: the set of versioned URL→response namespaces
//! - `TtlStore`: the auxiliary key→record store for perishable derived
//!   data, kept in its own namespace with expiry and corruption detection

pub mod policy;
pub mod storage;
pub mod ttl_store;

pub use policy::is_cacheable;
pub use storage::{CacheStorage, NamespaceSummary};
pub use ttl_store::{AnnotatedRecord, AuxLookup, AuxRecord, TtlStore, HEALTH_KEY};
