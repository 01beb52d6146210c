use crate::models::Snapshot;
use crate::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Append-only record of committed snapshots, owned by the caller.
///
/// An update cycle only ever reads the last entry and appends new ones. Each
/// tracker instance should get its own store; sharing one merges timelines.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn last(&self) -> Result<Option<Snapshot>>;

    async fn append(&self, snapshot: Snapshot) -> Result<()>;
}

/// Process-local history. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: RwLock<Vec<Snapshot>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn get(&self, index: usize) -> Option<Snapshot> {
        self.entries.read().await.get(index).cloned()
    }

    /// Copy of every committed snapshot, oldest first.
    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn last(&self) -> Result<Option<Snapshot>> {
        Ok(self.entries.read().await.last().cloned())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(begin_update = %snapshot.begin_update))]
    async fn append(&self, snapshot: Snapshot) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(snapshot);
        tracing::debug!(len = entries.len(), "snapshot appended to history");
        Ok(())
    }
}
