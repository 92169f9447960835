//! Skycache Core - offline caching and fallback-delivery agent.
//!
//! The agent sits between an installable web application and the network.
//! It keeps versioned namespaces of static assets, resolves requests
//! network-first with ordered offline fallbacks, holds perishable derived
//! data in a TTL-bound auxiliary store, and exposes a request/reply control
//! protocol for diagnostics and cache management.
//!
//! # Modules
//!
//! - `agent`: The `Agent` value and its event loop
//! - `cache`: Namespace storage and the auxiliary TTL store
//! - `lifecycle`: Install/activate of the active namespace
//! - `resolver`: Tiered fallback resolution
//! - `protocol`: Control commands, replies and the caller-side client
//! - `sync`: Durable retry queue and periodic sync signals
//! - `net`: The network seam and its implementations
//! - `broadcast`: Notifications to live application instances
//! - `config`: Agent configuration
//! - `error`: Error types
//! - `utils`: Formatting helpers

pub mod agent;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod protocol;
pub mod resolver;
pub mod sync;
pub mod utils;

// Re-export commonly used types at crate root
pub use agent::{Agent, AgentEvent};
pub use broadcast::{Broadcaster, Notification};
pub use cache::{CacheStorage, TtlStore};
pub use config::AgentConfig;
pub use error::{ClientError, CommandError, FetchError, StorageError, TtlStoreError};
pub use lifecycle::LifecycleManager;
pub use net::{Network, Request, Response};
pub use protocol::{Command, ControlClient, Reply, ReplyEnvelope};
pub use resolver::{Resolution, Resolver, Source};
