//! Terminal outcomes of an update cycle and the sink that receives them.

use crate::history::HistoryStore;
use crate::models::Snapshot;
use crate::Error;
use async_trait::async_trait;
use std::sync::Arc;

/// What a cycle reports to its notifier.
#[derive(Debug, Clone)]
pub enum CycleReport {
    /// The snapshot was appended to history. Also sent after a `Rejected`
    /// report that the notifier chose to keep.
    Committed(Snapshot),
    /// Augmentation failed after a change was detected. `partial` holds the
    /// base fields only; the notifier's [`Decision`] decides whether it is
    /// committed anyway.
    Rejected { partial: Snapshot, error: Error },
    /// The cycle failed without producing a usable snapshot: base resolution
    /// failed, or something escaped the cycle body.
    Fatal(Error),
}

impl CycleReport {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Self::Committed(snapshot) => Some(snapshot),
            Self::Rejected { partial, .. } => Some(partial),
            Self::Fatal(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Committed(_) => None,
            Self::Rejected { error, .. } | Self::Fatal(error) => Some(error),
        }
    }
}

/// A notifier's answer to a report. Only read for [`CycleReport::Rejected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// Commit the partial snapshot anyway.
    Keep,
    #[default]
    Discard,
}

/// Receives every terminal outcome of a tracker's cycles.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &CycleReport, history: &dyn HistoryStore) -> Decision;
}

struct FnNotifier<F>(F);

#[async_trait]
impl<F> Notifier for FnNotifier<F>
where
    F: Fn(&CycleReport) -> Decision + Send + Sync,
{
    async fn notify(&self, report: &CycleReport, _history: &dyn HistoryStore) -> Decision {
        (self.0)(report)
    }
}

/// Adapt a synchronous closure into a [`Notifier`].
pub fn notifier_fn<F>(f: F) -> Arc<dyn Notifier>
where
    F: Fn(&CycleReport) -> Decision + Send + Sync + 'static,
{
    Arc::new(FnNotifier(f))
}
