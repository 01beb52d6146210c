//! Tracker core: dependency-resolved, periodically refreshed data snapshots.
//!
//! A [`TrackerImage`] declares base and augment data nodes. A
//! [`TrackerInstance`] binds an image to concrete inputs, and
//! [`start_tracker`] ticks it until the returned [`TrackerHandle`] is stopped.

pub mod config;
pub mod cycle;
pub mod error;
pub mod graph;
pub mod history;
pub mod models;
pub mod notify;
pub mod o11y;
pub mod resolver;
pub mod scheduler;

pub use config::TrackerConfig;
pub use cycle::{run_cycle, CycleOutcome};
pub use error::{Error, Result};
pub use graph::ResolutionPlan;
pub use history::{HistoryStore, InMemoryHistory};
pub use models::{
    is_reserved, producer_fn, ChangePredicate, DataNodeSpec, NodeSet, Phase, Producer, Snapshot,
    TrackerImage, TrackerImageBuilder, TrackerInstance, BEGIN_UPDATE, END_UPDATE, RESERVED_NAMES,
};
pub use notify::{notifier_fn, CycleReport, Decision, Notifier};
pub use resolver::Resolver;
pub use scheduler::{start_tracker, TrackerHandle};
