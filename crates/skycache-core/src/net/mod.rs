//! Network access for the agent.
//!
//! This module provides the `Network` seam every outbound fetch goes
//! through, the `Request`/`Response` values passed across it, and three
//! implementations:
//!
//! - `HttpNetwork`: real HTTP via reqwest
//! - `StaticNetwork`: in-memory routes with an online toggle, for tests and demos
//! - `OfflineNetwork`: fails every request

pub mod client;
pub mod memory;
pub mod request;

use futures::future::BoxFuture;

use crate::error::FetchError;

pub use client::HttpNetwork;
pub use memory::{OfflineNetwork, StaticNetwork};
pub use request::{CacheMode, Request, Response};

/// Something that can perform an outbound request.
///
/// Returns `Err` only when no response was obtained at all. HTTP error
/// statuses come back as `Ok` responses.
pub trait Network: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}
