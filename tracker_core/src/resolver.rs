//! Memoized, concurrent resolution of data nodes into a snapshot.
//!
//! Every node needed by a resolve call gets exactly one shared future, created
//! in dependency order from the image's cached [`ResolutionPlan`]. Dependents
//! await clones of that future, so a dependency shared by several siblings runs
//! its producer once per snapshot while independent branches run concurrently.

use crate::graph::ResolutionPlan;
use crate::models::{is_reserved, NodeSet, Producer, Snapshot};
use crate::{Error, Result};
use futures::future::{try_join_all, BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;

type NodeFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Resolves the nodes of one phase (base or augment) into a snapshot.
pub struct Resolver<'a> {
    nodes: &'a NodeSet,
    plan: &'a ResolutionPlan,
    default_timeout: Option<Duration>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        nodes: &'a NodeSet,
        plan: &'a ResolutionPlan,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            nodes,
            plan,
            default_timeout,
        }
    }

    /// Ensure `snapshot[name]` is populated, resolving missing dependencies first.
    pub async fn resolve(&self, name: &str, snapshot: &mut Snapshot) -> Result<()> {
        self.resolve_roots(&[name], snapshot).await
    }

    /// Resolve every node in scope.
    pub async fn resolve_all(&self, snapshot: &mut Snapshot) -> Result<()> {
        let roots: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        self.resolve_roots(&roots, snapshot).await
    }

    /// Resolved values are merged into `snapshot` only when every root succeeds;
    /// on failure the snapshot is left as it was.
    #[tracing::instrument(level = "debug", skip(self, snapshot))]
    async fn resolve_roots(&self, roots: &[&str], snapshot: &mut Snapshot) -> Result<()> {
        let needed = self.collect_missing(roots, snapshot)?;
        if needed.is_empty() {
            return Ok(());
        }

        let working = Arc::new(Mutex::new(snapshot.clone()));
        let mut futures: HashMap<&str, NodeFuture> = HashMap::with_capacity(needed.len());

        for name in self.plan.order() {
            if !needed.contains(name.as_str()) {
                continue;
            }
            let spec = self.nodes.get(name).ok_or_else(|| {
                Error::configuration(format!("data \"{name}\" missing from resolution plan"))
            })?;
            let dependencies: Vec<NodeFuture> = spec
                .dependencies()
                .iter()
                .filter_map(|dep| futures.get(dep.as_str()).cloned())
                .collect();
            let fut = produce_node(
                name.clone(),
                dependencies,
                spec.producer().clone(),
                spec.timeout().or(self.default_timeout),
                working.clone(),
            );
            futures.insert(name.as_str(), fut);
        }

        let root_futures: Vec<NodeFuture> = roots
            .iter()
            .filter_map(|root| futures.get(root).cloned())
            .collect();
        try_join_all(root_futures).await?;

        let resolved = working.lock().await;
        for name in needed {
            if let Some(value) = resolved.get(name) {
                snapshot.insert(name.to_string(), value.clone());
            }
        }
        Ok(())
    }

    /// Names that must be produced to satisfy `roots`, skipping anything the
    /// snapshot already holds.
    fn collect_missing<'s>(
        &'s self,
        roots: &[&'s str],
        snapshot: &Snapshot,
    ) -> Result<BTreeSet<&'s str>> {
        let mut needed = BTreeSet::new();
        let mut stack: Vec<&'s str> = Vec::new();

        for root in roots {
            if is_reserved(root) {
                return Err(Error::configuration(format!(
                    "data name \"{root}\" is a reserved name"
                )));
            }
            if snapshot.contains(root) {
                continue;
            }
            if !self.nodes.contains_key(*root) {
                return Err(Error::configuration(format!(
                    "data \"{root}\" is not declared"
                )));
            }
            stack.push(*root);
        }

        while let Some(name) = stack.pop() {
            if !needed.insert(name) {
                continue;
            }
            let Some(spec) = self.nodes.get(name) else {
                continue;
            };
            for dep in spec.dependencies() {
                if snapshot.contains(dep) || needed.contains(dep.as_str()) {
                    continue;
                }
                if !self.nodes.contains_key(dep) {
                    return Err(Error::configuration(format!(
                        "unknown dependency \"{dep}\" of data \"{name}\""
                    )));
                }
                stack.push(dep.as_str());
            }
        }
        Ok(needed)
    }
}

fn produce_node(
    name: String,
    dependencies: Vec<NodeFuture>,
    producer: Arc<dyn Producer>,
    timeout: Option<Duration>,
    working: Arc<Mutex<Snapshot>>,
) -> NodeFuture {
    let span = tracing::debug_span!("tracker.produce", node = %name);
    async move {
        try_join_all(dependencies).await?;

        let partial = working.lock().await.clone();
        let started = std::time::Instant::now();
        let produced = match timeout {
            Some(limit) => match tokio::time::timeout(limit, producer.produce(&partial)).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout {
                    node: name.clone(),
                    after_ms: limit.as_millis() as u64,
                }),
            },
            None => producer.produce(&partial).await,
        };
        let value = produced.map_err(|e| Error::producer(name.clone(), e))?;
        tracing::debug!(
            duration_ms = started.elapsed().as_millis() as u64,
            "producer completed"
        );

        working.lock().await.insert(name, value);
        Ok(())
    }
    .instrument(span)
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{producer_fn, DataNodeSpec, Phase, RESERVED_NAMES};
    use chrono::Utc;
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(value: Value, calls: Arc<AtomicUsize>, delay_ms: u64) -> DataNodeSpec {
        DataNodeSpec::new(producer_fn(move |_| {
            let value = value.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(value)
            }
        }))
    }

    fn plus_one(of: &'static str) -> DataNodeSpec {
        DataNodeSpec::new(producer_fn(move |snapshot| async move {
            let v = snapshot
                .get(of)
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::BackendMessage(format!("{of} missing")))?;
            Ok::<Value, Error>(json!(v + 1))
        }))
        .depends_on([of])
    }

    fn failing(message: &'static str) -> DataNodeSpec {
        DataNodeSpec::new(producer_fn(move |_| async move {
            Err::<Value, Error>(Error::BackendMessage(message.to_string()))
        }))
    }

    fn empty_snapshot() -> Snapshot {
        Snapshot::seed(&Map::new(), Utc::now())
    }

    fn plan_for(nodes: &NodeSet) -> ResolutionPlan {
        ResolutionPlan::build(Phase::Base, nodes).unwrap()
    }

    #[tokio::test]
    async fn resolves_dependencies_before_dependents() {
        let mut nodes = NodeSet::new();
        nodes.insert(
            "a".to_string(),
            counting(json!(1), Arc::new(AtomicUsize::new(0)), 0),
        );
        nodes.insert("b".to_string(), plus_one("a"));
        let plan = plan_for(&nodes);

        let mut snapshot = empty_snapshot();
        Resolver::new(&nodes, &plan, None)
            .resolve_all(&mut snapshot)
            .await
            .unwrap();
        assert_eq!(snapshot.get("a"), Some(&json!(1)));
        assert_eq!(snapshot.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn diamond_dependency_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut nodes = NodeSet::new();
        nodes.insert("root".to_string(), counting(json!(1), calls.clone(), 20));
        nodes.insert("left".to_string(), plus_one("root"));
        nodes.insert("right".to_string(), plus_one("root"));
        nodes.insert(
            "join".to_string(),
            DataNodeSpec::new(producer_fn(|snapshot| async move {
                let l = snapshot.get("left").and_then(Value::as_i64).unwrap_or(0);
                let r = snapshot.get("right").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(l + r))
            }))
            .depends_on(["left", "right"]),
        );
        let plan = plan_for(&nodes);

        let mut snapshot = empty_snapshot();
        Resolver::new(&nodes, &plan, None)
            .resolve_all(&mut snapshot)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.get("join"), Some(&json!(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_branches_run_concurrently() {
        let mut nodes = NodeSet::new();
        for name in ["a", "b", "c"] {
            nodes.insert(
                name.to_string(),
                counting(json!(name), Arc::new(AtomicUsize::new(0)), 100),
            );
        }
        let plan = plan_for(&nodes);

        let started = tokio::time::Instant::now();
        let mut snapshot = empty_snapshot();
        Resolver::new(&nodes, &plan, None)
            .resolve_all(&mut snapshot)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(snapshot.values().len(), 3);
    }

    #[tokio::test]
    async fn present_values_are_not_reproduced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut nodes = NodeSet::new();
        nodes.insert("a".to_string(), counting(json!(1), calls.clone(), 0));
        let plan = plan_for(&nodes);

        let resolver = Resolver::new(&nodes, &plan, None);
        let mut snapshot = empty_snapshot();
        resolver.resolve("a", &mut snapshot).await.unwrap();
        resolver.resolve("a", &mut snapshot).await.unwrap();
        resolver.resolve_all(&mut snapshot).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reserved_names_are_configuration_errors() {
        let nodes = NodeSet::new();
        let plan = ResolutionPlan::default();
        let resolver = Resolver::new(&nodes, &plan, None);
        for name in RESERVED_NAMES {
            let mut snapshot = empty_snapshot();
            let err = resolver.resolve(name, &mut snapshot).await.unwrap_err();
            assert!(err.is_configuration(), "{name}: {err}");
        }
    }

    #[tokio::test]
    async fn undeclared_dependency_is_a_configuration_error() {
        let mut nodes = NodeSet::new();
        nodes.insert("b".to_string(), plus_one("a"));
        let plan = plan_for(&nodes);

        let mut snapshot = empty_snapshot();
        let err = Resolver::new(&nodes, &plan, None)
            .resolve_all(&mut snapshot)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn failure_rejects_dependents_and_leaves_snapshot_untouched() {
        let dependent_calls = Arc::new(AtomicUsize::new(0));
        let mut nodes = NodeSet::new();
        nodes.insert("ok".to_string(), counting(json!(1), Arc::new(AtomicUsize::new(0)), 0));
        nodes.insert("broken".to_string(), failing("upstream returned 503"));
        nodes.insert(
            "dependent".to_string(),
            counting(json!(2), dependent_calls.clone(), 0).depends_on(["broken"]),
        );
        let plan = plan_for(&nodes);

        let mut snapshot = empty_snapshot();
        let err = Resolver::new(&nodes, &plan, None)
            .resolve_all(&mut snapshot)
            .await
            .unwrap_err();
        assert_eq!(err.failed_node(), Some("broken"));
        assert_eq!(dependent_calls.load(Ordering::SeqCst), 0);
        assert!(snapshot.values().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn producer_timeout_is_reported() {
        let mut nodes = NodeSet::new();
        nodes.insert(
            "slow".to_string(),
            counting(json!(1), Arc::new(AtomicUsize::new(0)), 5_000),
        );
        nodes.insert(
            "bounded".to_string(),
            counting(json!(1), Arc::new(AtomicUsize::new(0)), 5_000)
                .with_timeout(Duration::from_millis(10)),
        );
        let plan = plan_for(&nodes);

        let mut snapshot = empty_snapshot();
        let err = Resolver::new(&nodes, &plan, Some(Duration::from_secs(60)))
            .resolve_all(&mut snapshot)
            .await
            .unwrap_err();
        match err {
            Error::Timeout { node, after_ms } => {
                assert_eq!(node, "bounded");
                assert_eq!(after_ms, 10);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
