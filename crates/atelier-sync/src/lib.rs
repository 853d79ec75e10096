//! Realtime change-feed reconciliation for Atelier's client-side cache.
//!
//! Keeps eight collections (clients, projects, tasks, timesheets, project
//! members, absences, holidays and users) consistent with the backing store
//! by combining one bulk load with a live row-level change feed.
//!
//! ## Features
//!
//! - **Normalize**: raw rows of any known shape into canonical entities
//! - **Cache**: ordered collections with sequence-aware upsert, remove and replace
//! - **Loader**: concurrent per-collection snapshot reads with failure isolation
//! - **Subscriber**: one feed subscription per table, pumped into one dispatcher
//! - **Patcher**: join-table events as set patches on the parent task
//! - **Views**: soft-delete filtered views published over `watch` channels
//! - **Session**: open/close lifecycle tying it all together
//! - **Transports**: PostgREST reads, Phoenix realtime feed, in-memory backend

pub mod cache;
mod config;
pub mod dispatch;
mod error;
pub mod loader;
pub mod memory;
pub mod normalize;
pub mod patcher;
pub mod realtime;
pub mod rest;
pub mod session;
pub mod subscriber;
mod types;
pub mod views;

pub use cache::{Applied, CacheStore, CacheUpdate, Collection, Removal, SeqClock, Stored};
pub use config::SyncConfig;
pub use dispatch::{Dispatched, Envelope, StoreMessage, apply, dispatch};
pub use error::{NormalizeError, SyncError};
pub use loader::{BulkLoader, LoadProgress, LoadReport, LoadStatus, SnapshotSource, SyncState};
pub use memory::MemoryBackend;
pub use normalize::Normalize;
pub use patcher::{PatchOp, PatchOutcome, RelationField};
pub use realtime::RealtimeClient;
pub use rest::RestClient;
pub use session::{Session, SessionContext};
pub use subscriber::{ChangeFeed, ChangeFeedSubscriber, EventStream, FeedHandle};
pub use types::*;
pub use views::{Published, View, ViewPublisher, Views, visible};
