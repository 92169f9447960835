//! Versioned namespace lifecycle.
//!
//! The active namespace name is derived from the build identifier.
//! `install` fills it from the asset manifest and `activate` sweeps every
//! namespace left behind by earlier builds. Both are guarded by a
//! `SingleFlight` so overlapping lifecycle events cannot race.

pub mod manager;
pub mod manifest;
pub mod single_flight;

pub use manager::{ActivateReport, AssetReport, InstallReport, LifecycleManager};
pub use manifest::{AssetManifest, AssetOutcome};
pub use single_flight::{FlightGuard, SingleFlight};
