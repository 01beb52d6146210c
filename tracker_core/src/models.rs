use crate::graph::ResolutionPlan;
use crate::resolver::Resolver;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Snapshot field stamped when a cycle starts.
pub const BEGIN_UPDATE: &str = "begin_update";
/// Snapshot field stamped when a cycle commits.
pub const END_UPDATE: &str = "end_update";
/// Names no data node or input field may use.
pub const RESERVED_NAMES: [&str; 2] = [BEGIN_UPDATE, END_UPDATE];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// The full set of values assembled by one update cycle.
///
/// Serializes to a single flat JSON object: input fields and resolved data
/// nodes side by side with the `begin_update` / `end_update` timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub begin_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_update: Option<DateTime<Utc>>,
    #[serde(flatten)]
    values: Map<String, Value>,
}

impl Snapshot {
    /// Seed a snapshot from a copy of the instance inputs.
    pub fn seed(inputs: &Map<String, Value>, begin_update: DateTime<Utc>) -> Self {
        Self {
            begin_update,
            end_update: None,
            values: inputs.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// True when `name` already holds a value (input field or resolved node).
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub(crate) fn insert(&mut self, name: String, value: Value) {
        self.values.insert(name, value);
    }

    /// Stamp `end_update`, marking the snapshot ready for history.
    pub(crate) fn finish(&mut self, at: DateTime<Utc>) {
        self.end_update = Some(at);
    }
}

/// Asynchronous producer of one data node's value.
///
/// Receives the partially filled snapshot of the running cycle; every declared
/// dependency is guaranteed to be present.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(&self, snapshot: &Snapshot) -> Result<Value>;
}

struct FnProducer<F>(F);

#[async_trait]
impl<F, Fut> Producer for FnProducer<F>
where
    F: Fn(Snapshot) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn produce(&self, snapshot: &Snapshot) -> Result<Value> {
        (self.0)(snapshot.clone()).await
    }
}

/// Adapt an async closure into a [`Producer`]. The closure gets its own copy of
/// the partial snapshot.
pub fn producer_fn<F, Fut>(f: F) -> Arc<dyn Producer>
where
    F: Fn(Snapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnProducer(f))
}

/// A named, possibly dependent, asynchronous value producer.
#[derive(Clone)]
pub struct DataNodeSpec {
    dependencies: BTreeSet<String>,
    producer: Arc<dyn Producer>,
    timeout: Option<Duration>,
}

impl DataNodeSpec {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            dependencies: BTreeSet::new(),
            producer,
            timeout: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    /// Override the scheduler-wide producer timeout for this node.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn producer(&self) -> &Arc<dyn Producer> {
        &self.producer
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for DataNodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataNodeSpec")
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Data nodes in scope for one resolution phase, keyed by name.
pub type NodeSet = BTreeMap<String, DataNodeSpec>;

/// Decides whether a freshly resolved base snapshot differs meaningfully from
/// the last committed one.
pub type ChangePredicate = Arc<dyn Fn(&Snapshot, &Snapshot) -> bool + Send + Sync>;

/// The two resolution tiers of an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Base,
    Augment,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => f.write_str("base"),
            Self::Augment => f.write_str("augment"),
        }
    }
}

/// Immutable schema shared by every instance of one kind of tracker.
pub struct TrackerImage {
    required_inputs: BTreeSet<String>,
    min_time_to_update: Duration,
    base_data: NodeSet,
    augment_data: NodeSet,
    change_predicate: ChangePredicate,
    base_plan: ResolutionPlan,
    augment_plan: ResolutionPlan,
}

impl TrackerImage {
    pub fn builder() -> TrackerImageBuilder {
        TrackerImageBuilder::default()
    }

    pub fn required_inputs(&self) -> &BTreeSet<String> {
        &self.required_inputs
    }

    pub fn min_time_to_update(&self) -> Duration {
        self.min_time_to_update
    }

    pub fn nodes(&self, phase: Phase) -> &NodeSet {
        match phase {
            Phase::Base => &self.base_data,
            Phase::Augment => &self.augment_data,
        }
    }

    pub fn plan(&self, phase: Phase) -> &ResolutionPlan {
        match phase {
            Phase::Base => &self.base_plan,
            Phase::Augment => &self.augment_plan,
        }
    }

    pub fn resolver(&self, phase: Phase, default_timeout: Option<Duration>) -> Resolver<'_> {
        Resolver::new(self.nodes(phase), self.plan(phase), default_timeout)
    }

    /// Evaluate the change predicate. Without a previous snapshot the change is
    /// implicit.
    pub fn has_changed(&self, previous: Option<&Snapshot>, current: &Snapshot) -> bool {
        match previous {
            None => true,
            Some(previous) => (self.change_predicate)(previous, current),
        }
    }
}

impl fmt::Debug for TrackerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerImage")
            .field("required_inputs", &self.required_inputs)
            .field("min_time_to_update", &self.min_time_to_update)
            .field("base_data", &self.base_data)
            .field("augment_data", &self.augment_data)
            .finish_non_exhaustive()
    }
}

pub struct TrackerImageBuilder {
    required_inputs: BTreeSet<String>,
    min_time_to_update: Duration,
    base_data: NodeSet,
    augment_data: NodeSet,
    change_predicate: Option<ChangePredicate>,
}

impl Default for TrackerImageBuilder {
    fn default() -> Self {
        Self {
            required_inputs: BTreeSet::new(),
            min_time_to_update: Duration::ZERO,
            base_data: NodeSet::new(),
            augment_data: NodeSet::new(),
            change_predicate: None,
        }
    }
}

impl TrackerImageBuilder {
    pub fn required_input(mut self, name: impl Into<String>) -> Self {
        self.required_inputs.insert(name.into());
        self
    }

    pub fn required_inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn min_time_to_update(mut self, min_time_to_update: Duration) -> Self {
        self.min_time_to_update = min_time_to_update;
        self
    }

    pub fn base(mut self, name: impl Into<String>, spec: DataNodeSpec) -> Self {
        self.base_data.insert(name.into(), spec);
        self
    }

    pub fn augment(mut self, name: impl Into<String>, spec: DataNodeSpec) -> Self {
        self.augment_data.insert(name.into(), spec);
        self
    }

    /// Defaults to "always changed" when unset.
    pub fn change_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Snapshot, &Snapshot) -> bool + Send + Sync + 'static,
    {
        self.change_predicate = Some(Arc::new(predicate));
        self
    }

    /// Validate the node graphs and freeze the image.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn build(self) -> Result<Arc<TrackerImage>> {
        for input in &self.required_inputs {
            if input.trim().is_empty() {
                return Err(Error::configuration("required input name is empty"));
            }
            if is_reserved(input) {
                return Err(Error::configuration(format!(
                    "input name \"{input}\" is a reserved name"
                )));
            }
        }

        for name in self.base_data.keys().chain(self.augment_data.keys()) {
            if self.required_inputs.contains(name) {
                return Err(Error::configuration(format!(
                    "data name \"{name}\" shadows a required input"
                )));
            }
        }
        if let Some(name) = self
            .base_data
            .keys()
            .find(|name| self.augment_data.contains_key(*name))
        {
            return Err(Error::configuration(format!(
                "data name \"{name}\" is declared as both base and augment data"
            )));
        }

        // Base nodes run before augmentation, so they can never see augment values.
        for (name, spec) in &self.base_data {
            if let Some(dep) = spec
                .dependencies()
                .iter()
                .find(|dep| self.augment_data.contains_key(*dep))
            {
                return Err(Error::configuration(format!(
                    "base data \"{name}\" depends on augment data \"{dep}\""
                )));
            }
        }

        let base_plan = ResolutionPlan::build(Phase::Base, &self.base_data)?;
        let augment_plan = ResolutionPlan::build(Phase::Augment, &self.augment_data)?;

        Ok(Arc::new(TrackerImage {
            required_inputs: self.required_inputs,
            min_time_to_update: self.min_time_to_update,
            base_data: self.base_data,
            augment_data: self.augment_data,
            change_predicate: self
                .change_predicate
                .unwrap_or_else(|| Arc::new(|_: &Snapshot, _: &Snapshot| true)),
            base_plan,
            augment_plan,
        }))
    }
}

/// One running tracker's identity: a shared image plus caller-supplied inputs.
#[derive(Debug, Clone)]
pub struct TrackerInstance {
    name: String,
    image: Arc<TrackerImage>,
    input_data: Map<String, Value>,
}

impl TrackerInstance {
    pub fn new(
        name: impl Into<String>,
        image: Arc<TrackerImage>,
        input_data: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            image,
            input_data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &Arc<TrackerImage> {
        &self.image
    }

    pub fn input_data(&self) -> &Map<String, Value> {
        &self.input_data
    }

    /// Check the inputs against the image before any cycle is scheduled.
    #[tracing::instrument(level = "debug", skip(self), fields(tracker = %self.name))]
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<String> = self
            .image
            .required_inputs()
            .iter()
            .filter(|name| !self.input_data.contains_key(*name))
            .map(|name| format!("\"{name}\""))
            .collect();
        if !missing.is_empty() {
            return Err(Error::configuration(format!(
                "missing required inputs: {}",
                missing.join(", ")
            )));
        }

        for name in self.input_data.keys() {
            if is_reserved(name) {
                return Err(Error::configuration(format!(
                    "input name \"{name}\" is a reserved name"
                )));
            }
            if self.image.nodes(Phase::Base).contains_key(name)
                || self.image.nodes(Phase::Augment).contains_key(name)
            {
                return Err(Error::configuration(format!(
                    "input \"{name}\" shadows a data node of the same name"
                )));
            }
        }

        // Dependencies outside a phase must already be in the snapshot when that phase starts.
        for dep in self.image.plan(Phase::Base).external_dependencies() {
            if !self.input_data.contains_key(dep) {
                return Err(Error::configuration(format!(
                    "unknown dependency \"{dep}\" in base data"
                )));
            }
        }
        for dep in self.image.plan(Phase::Augment).external_dependencies() {
            if !self.input_data.contains_key(dep)
                && !self.image.nodes(Phase::Base).contains_key(dep)
            {
                return Err(Error::configuration(format!(
                    "unknown dependency \"{dep}\" in augment data"
                )));
            }
        }
        Ok(())
    }
}
