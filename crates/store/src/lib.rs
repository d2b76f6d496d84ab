//! hotrank engine: event processing, window merges, cold-start backfill, counter
//! write-back and the published top-N snapshots.
//!
//! Readers go through [`Engine::top`], which is a lock-free snapshot load. Writers are the
//! ingest loop ([`spawn_ingest`]) and the scheduled refreshes started by
//! [`Engine::spawn_schedule`].

#![forbid(unsafe_code)]

pub mod activity;
pub mod backfill;
pub mod codec;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod loader;
pub mod pool;
pub mod processor;
pub mod reconcile;
pub mod refresher;
pub mod schedule;
pub mod snapshot;
pub mod windows;

pub use config::{Cadence, EngineConfig, LoaderConfig, ScheduleConfig};
pub use engine::{Engine, EngineStats};
pub use ingest::spawn_ingest;
pub use processor::Applied;
pub use reconcile::ReconcileOutcome;
pub use refresher::RefreshOutcome;
pub use snapshot::{RankSnapshot, RankedItem};
