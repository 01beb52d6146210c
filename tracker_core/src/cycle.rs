//! One update cycle: resolve base data, gate on change, augment, commit.

use crate::history::HistoryStore;
use crate::models::{Phase, Snapshot, TrackerInstance};
use crate::notify::{CycleReport, Decision, Notifier};
use crate::Result;
use chrono::Utc;
use std::fmt;
use std::time::Duration;

/// How a cycle ended. Notifications have already been sent when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Committed,
    /// The change predicate found nothing new; nothing was appended or reported.
    Unchanged,
    BaseFailed,
    AugmentDiscarded,
    /// Augmentation failed but the notifier kept the partial snapshot.
    PartialCommitted,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Committed => "committed",
            Self::Unchanged => "unchanged",
            Self::BaseFailed => "base_failed",
            Self::AugmentDiscarded => "augment_discarded",
            Self::PartialCommitted => "partial_committed",
        };
        f.write_str(s)
    }
}

/// Run one cycle for `instance`.
///
/// Producer failures are reported through `notifier` and end the cycle with an
/// `Ok` outcome. `Err` is returned only when the history store itself fails;
/// the caller reports that as a fatal error.
#[tracing::instrument(level = "debug", skip_all, fields(tracker = %instance.name()))]
pub async fn run_cycle(
    instance: &TrackerInstance,
    history: &dyn HistoryStore,
    notifier: &dyn Notifier,
    producer_timeout: Option<Duration>,
) -> Result<CycleOutcome> {
    let image = instance.image();
    let mut snapshot = Snapshot::seed(instance.input_data(), Utc::now());

    if let Err(e) = image
        .resolver(Phase::Base, producer_timeout)
        .resolve_all(&mut snapshot)
        .await
    {
        tracing::warn!(error = %e, "base data resolution failed");
        notifier.notify(&CycleReport::Fatal(e), history).await;
        return Ok(CycleOutcome::BaseFailed);
    }

    let previous = history.last().await?;
    if !image.has_changed(previous.as_ref(), &snapshot) {
        tracing::debug!("no change since last snapshot");
        return Ok(CycleOutcome::Unchanged);
    }

    let augmented = image
        .resolver(Phase::Augment, producer_timeout)
        .resolve_all(&mut snapshot)
        .await;

    match augmented {
        Ok(()) => {
            commit(&mut snapshot, history).await?;
            notifier
                .notify(&CycleReport::Committed(snapshot), history)
                .await;
            Ok(CycleOutcome::Committed)
        }
        Err(e) => {
            tracing::warn!(error = %e, "augment data resolution failed");
            let report = CycleReport::Rejected {
                partial: snapshot.clone(),
                error: e,
            };
            match notifier.notify(&report, history).await {
                Decision::Discard => Ok(CycleOutcome::AugmentDiscarded),
                Decision::Keep => {
                    commit(&mut snapshot, history).await?;
                    notifier
                        .notify(&CycleReport::Committed(snapshot), history)
                        .await;
                    Ok(CycleOutcome::PartialCommitted)
                }
            }
        }
    }
}

async fn commit(snapshot: &mut Snapshot, history: &dyn HistoryStore) -> Result<()> {
    snapshot.finish(Utc::now());
    history.append(snapshot.clone()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;
    use crate::models::{producer_fn, DataNodeSpec, TrackerImage};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Recorder {
        decision: Decision,
        reports: Mutex<Vec<CycleReport>>,
    }

    impl Recorder {
        fn new(decision: Decision) -> Self {
            Self {
                decision,
                reports: Mutex::new(Vec::new()),
            }
        }

        fn reports(&self) -> Vec<CycleReport> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, report: &CycleReport, _history: &dyn HistoryStore) -> Decision {
            self.reports.lock().unwrap().push(report.clone());
            self.decision
        }
    }

    fn constant(value: Value) -> DataNodeSpec {
        DataNodeSpec::new(producer_fn(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        }))
    }

    fn counting(calls: Arc<AtomicUsize>) -> DataNodeSpec {
        DataNodeSpec::new(producer_fn(move |_| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(n))
            }
        }))
    }

    fn failing() -> DataNodeSpec {
        DataNodeSpec::new(producer_fn(|_| async {
            Err::<Value, Error>(Error::BackendMessage("forecast unavailable".to_string()))
        }))
    }

    fn instance(image: Arc<TrackerImage>) -> TrackerInstance {
        let mut inputs = Map::new();
        inputs.insert("city_name".to_string(), json!("dijon"));
        TrackerInstance::new("dijon", image, inputs)
    }

    async fn cycle(
        instance: &TrackerInstance,
        history: &InMemoryHistory,
        notifier: &Recorder,
    ) -> Result<CycleOutcome> {
        run_cycle(instance, history, notifier, None).await
    }

    #[tokio::test]
    async fn commits_dependent_values() {
        let image = TrackerImage::builder()
            .base("a", constant(json!(1)))
            .base(
                "b",
                DataNodeSpec::new(producer_fn(|snapshot| async move {
                    let a = snapshot.get("a").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(a + 1))
                }))
                .depends_on(["a"]),
            )
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Discard);

        let outcome = cycle(&instance, &history, &notifier).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Committed);

        let committed = history.last().await.unwrap().unwrap();
        assert_eq!(committed.get("a"), Some(&json!(1)));
        assert_eq!(committed.get("b"), Some(&json!(2)));
        assert_eq!(committed.get("city_name"), Some(&json!("dijon")));
        let end = committed.end_update.unwrap();
        assert!(committed.begin_update <= end);

        let reports = notifier.reports();
        assert_eq!(reports.len(), 1);
        assert!(matches!(&reports[0], CycleReport::Committed(s) if *s == committed));
    }

    #[tokio::test]
    async fn first_cycle_augments_regardless_of_predicate() {
        let augment_calls = Arc::new(AtomicUsize::new(0));
        let image = TrackerImage::builder()
            .base("value", constant(json!(1)))
            .augment("extra", counting(augment_calls.clone()))
            .change_predicate(|_, _| false)
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Discard);

        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::Committed
        );
        assert_eq!(augment_calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::Unchanged
        );
        assert_eq!(augment_calls.load(Ordering::SeqCst), 1);
        assert_eq!(history.len().await, 1);
        assert_eq!(notifier.reports().len(), 1);
    }

    #[tokio::test]
    async fn change_predicate_sees_previous_and_current() {
        let reading = Arc::new(AtomicI64::new(10));
        let source = reading.clone();
        let image = TrackerImage::builder()
            .base(
                "dt",
                DataNodeSpec::new(producer_fn(move |_| {
                    let source = source.clone();
                    async move { Ok(json!(source.load(Ordering::SeqCst))) }
                })),
            )
            .change_predicate(|previous, current| {
                let prev = previous.get("dt").and_then(Value::as_i64).unwrap_or(0);
                let cur = current.get("dt").and_then(Value::as_i64).unwrap_or(0);
                cur > prev
            })
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Discard);

        cycle(&instance, &history, &notifier).await.unwrap();
        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::Unchanged
        );
        reading.store(11, Ordering::SeqCst);
        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::Committed
        );
        assert_eq!(history.len().await, 2);
    }

    #[tokio::test]
    async fn base_failure_reports_fatal_without_snapshot() {
        let image = TrackerImage::builder()
            .base("value", failing())
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Keep);

        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::BaseFailed
        );
        assert!(history.is_empty().await);
        let reports = notifier.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].snapshot().is_none());
        assert_eq!(reports[0].error().and_then(Error::failed_node), Some("value"));
    }

    #[tokio::test]
    async fn discarded_partial_is_not_committed() {
        let image = TrackerImage::builder()
            .base("value", constant(json!(1)))
            .augment("forecast", failing().depends_on(["value"]))
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Discard);

        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::AugmentDiscarded
        );
        assert!(history.is_empty().await);

        let reports = notifier.reports();
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            CycleReport::Rejected { partial, error } => {
                assert_eq!(partial.get("value"), Some(&json!(1)));
                assert!(!partial.contains("forecast"));
                assert!(partial.end_update.is_none());
                assert_eq!(error.failed_node(), Some("forecast"));
            }
            other => panic!("expected rejected report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn kept_partial_is_committed_and_reported_again() {
        let image = TrackerImage::builder()
            .base("value", constant(json!(1)))
            .augment("ok", constant(json!("fine")))
            .augment("forecast", failing())
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Keep);

        assert_eq!(
            cycle(&instance, &history, &notifier).await.unwrap(),
            CycleOutcome::PartialCommitted
        );
        assert_eq!(history.len().await, 1);
        let committed = history.last().await.unwrap().unwrap();
        assert!(committed.end_update.is_some());
        assert!(!committed.contains("ok"));
        assert!(!committed.contains("forecast"));

        let reports = notifier.reports();
        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0], CycleReport::Rejected { .. }));
        match &reports[1] {
            CycleReport::Committed(snapshot) => {
                assert!(reports[1].error().is_none());
                assert_eq!(*snapshot, committed);
                assert_eq!(reports[0].snapshot().map(Snapshot::values), Some(committed.values()));
            }
            other => panic!("expected committed report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_entries_are_not_aliased() {
        let calls = Arc::new(AtomicUsize::new(0));
        let image = TrackerImage::builder()
            .base("n", counting(calls))
            .build()
            .unwrap();
        let instance = instance(image);
        let history = InMemoryHistory::new();
        let notifier = Recorder::new(Decision::Discard);

        cycle(&instance, &history, &notifier).await.unwrap();
        let first = history.snapshots().await;
        cycle(&instance, &history, &notifier).await.unwrap();
        cycle(&instance, &history, &notifier).await.unwrap();

        let all = history.snapshots().await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], first[0]);
        assert_eq!(all[2].get("n"), Some(&json!(2)));
    }
}
