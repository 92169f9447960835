//! Tiered fallback resolution of intercepted requests.
//!
//! GET requests go to the network first; successful same-origin responses
//! are written back to the active namespace. When the network fails the
//! request walks an ordered list of `FallbackTier`s:
//!
//! 1. the active namespace
//! 2. every asset namespace, newest first
//! 3. the root document, for page requests
//!
//! and finally a synthesized `503` offline response.

pub mod chain;
pub mod tiers;

pub use chain::{offline_response, Resolution, Resolver, Source, OFFLINE_STATUS};
pub use tiers::{ActiveNamespace, AnyNamespace, FallbackTier, RootDocument};
