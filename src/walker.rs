//! Graph walker: reachability over a flow's step map and dependency discovery.
//!
//! Steps are held in an id-keyed map and traversal keeps a visited set, so
//! transition cycles terminate and every reachable step is expanded once.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::{
    bundle::FlowBundle,
    error::{FlowError, ObjectError, Operation, Outcome, Result, StoreError, StoreResult},
    fanout::FanOut,
    model::{FlowDoc, InnerStepRef, StepDoc, is_terminal},
    step_kind::{Dependency, StepKind, classify, classify_entry, step_type},
    store::{ObjectRef, ObjectStore},
};

/// Which outer steps a traversal covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoverScope {
    /// Steps reachable from the entry step by following transitions.
    #[default]
    Reachable,
    /// Every step in the flow's map, reachable or not.
    AllSteps,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoverOptions {
    pub scope: DiscoverScope,
}

/// A transition whose target is neither a step of the flow nor a terminal marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingTransition {
    pub from: String,
    pub outcome: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct Reachability {
    /// Reachable step ids in breadth-first visit order.
    pub order: Vec<String>,
    pub dangling: Vec<DanglingTransition>,
}

/// Breadth-first reachability from the entry step.
pub fn reachable_steps(flow: &FlowDoc) -> Result<Reachability> {
    let entry = flow
        .entry_node_id
        .as_deref()
        .filter(|entry| !entry.is_empty())
        .ok_or_else(|| FlowError::MissingEntry {
            flow_id: flow.id.clone(),
        })?;
    if !flow.nodes.contains_key(entry) {
        return Err(FlowError::EntryNotFound {
            flow_id: flow.id.clone(),
            entry: entry.to_string(),
        });
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut reach = Reachability::default();
    visited.insert(entry);
    queue.push_back(entry);

    while let Some(id) = queue.pop_front() {
        reach.order.push(id.to_string());
        let Some(node) = flow.nodes.get(id) else {
            continue;
        };
        for (outcome, target) in &node.connections {
            if is_terminal(target) {
                continue;
            }
            if !flow.nodes.contains_key(target.as_str()) {
                warn!(
                    flow = %flow.id,
                    step = %id,
                    outcome = %outcome,
                    target = %target,
                    "transition points at a step that does not exist"
                );
                reach.dangling.push(DanglingTransition {
                    from: id.to_string(),
                    outcome: outcome.clone(),
                    target: target.clone(),
                });
                continue;
            }
            if visited.insert(target.as_str()) {
                queue.push_back(target.as_str());
            }
        }
    }
    Ok(reach)
}

/// Every dangling transition in the flow, reachable or not.
pub fn dangling_transitions(flow: &FlowDoc) -> Vec<DanglingTransition> {
    let mut dangling = Vec::new();
    for (id, node) in &flow.nodes {
        for (outcome, target) in &node.connections {
            if !is_terminal(target) && !flow.nodes.contains_key(target) {
                dangling.push(DanglingTransition {
                    from: id.clone(),
                    outcome: outcome.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    dangling
}

/// Referenced object ids grouped by type, deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    pub scripts: BTreeSet<String>,
    pub email_templates: BTreeSet<String>,
    pub saml2_entities: BTreeSet<String>,
    pub social_providers: BTreeSet<String>,
    pub any_social_provider: bool,
    pub themes: BTreeSet<String>,
    pub inner_flows: BTreeSet<String>,
}

impl DependencySet {
    pub fn insert(&mut self, dependency: Dependency) {
        match dependency {
            Dependency::Script(id) => {
                self.scripts.insert(id);
            }
            Dependency::EmailTemplate(id) => {
                self.email_templates.insert(id);
            }
            Dependency::Saml2Entity(id) => {
                self.saml2_entities.insert(id);
            }
            Dependency::SocialProvider(id) => {
                self.social_providers.insert(id);
            }
            Dependency::AnySocialProvider => self.any_social_provider = true,
            Dependency::Theme(id) => {
                self.themes.insert(id);
            }
            Dependency::InnerFlow(id) => {
                self.inner_flows.insert(id);
            }
        }
    }

    pub fn contains(&self, dependency: &Dependency) -> bool {
        match dependency {
            Dependency::Script(id) => self.scripts.contains(id),
            Dependency::EmailTemplate(id) => self.email_templates.contains(id),
            Dependency::Saml2Entity(id) => self.saml2_entities.contains(id),
            Dependency::SocialProvider(id) => self.social_providers.contains(id),
            Dependency::AnySocialProvider => self.any_social_provider,
            Dependency::Theme(id) => self.themes.contains(id),
            Dependency::InnerFlow(id) => self.inner_flows.contains(id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Every dependency, one entry per referenced object.
    pub fn iter(&self) -> impl Iterator<Item = Dependency> + '_ {
        let any = self
            .any_social_provider
            .then_some(Dependency::AnySocialProvider);
        self.scripts
            .iter()
            .cloned()
            .map(Dependency::Script)
            .chain(self.email_templates.iter().cloned().map(Dependency::EmailTemplate))
            .chain(self.saml2_entities.iter().cloned().map(Dependency::Saml2Entity))
            .chain(self.social_providers.iter().cloned().map(Dependency::SocialProvider))
            .chain(any)
            .chain(self.themes.iter().cloned().map(Dependency::Theme))
            .chain(self.inner_flows.iter().cloned().map(Dependency::InnerFlow))
    }
}

impl Extend<Dependency> for DependencySet {
    fn extend<I: IntoIterator<Item = Dependency>>(&mut self, iter: I) {
        for dependency in iter {
            self.insert(dependency);
        }
    }
}

/// Everything a traversal found for one flow.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub flow_id: String,
    /// Outer step ids covered by the traversal, in visit order.
    pub step_ids: Vec<String>,
    /// Outer step bodies that could be fetched.
    pub steps: IndexMap<String, StepDoc>,
    /// Container step id to the inner step ids it embeds.
    pub containers: IndexMap<String, Vec<String>>,
    pub inner_steps: IndexMap<String, StepDoc>,
    pub dependencies: DependencySet,
    pub dangling: Vec<DanglingTransition>,
}

impl Discovery {
    pub fn inner_step_ids(&self) -> impl Iterator<Item = &String> {
        self.containers.values().flatten()
    }
}

/// Where step bodies come from during a traversal.
#[async_trait]
pub trait StepSource: Send + Sync {
    async fn fetch_step(&self, target: &ObjectRef) -> StoreResult<StepDoc>;
}

#[async_trait]
impl StepSource for FlowBundle {
    async fn fetch_step(&self, target: &ObjectRef) -> StoreResult<StepDoc> {
        self.nodes
            .get(&target.id)
            .or_else(|| self.inner_nodes.get(&target.id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

/// Reads steps from the live store, fetching each step at most once.
pub struct LiveSteps<'a> {
    store: &'a dyn ObjectStore,
    cache: Mutex<HashMap<String, StepDoc>>,
}

impl<'a> LiveSteps<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        LiveSteps {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, id: &str) -> Option<StepDoc> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(id).cloned())
    }
}

#[async_trait]
impl StepSource for LiveSteps<'_> {
    async fn fetch_step(&self, target: &ObjectRef) -> StoreResult<StepDoc> {
        if let Some(step) = self.cached(&target.id) {
            return Ok(step);
        }
        let body = self.store.read(target).await?;
        let step = StepDoc::from_value(body)
            .map_err(|e| StoreError::Rejected(format!("invalid step body: {e}")))?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(target.id.clone(), step.clone());
        }
        Ok(step)
    }
}

/// Walk `flow`, fetch its step bodies through `source` and collect every
/// dependency of every covered step and inner step.
pub async fn discover(
    flow: &FlowDoc,
    source: &dyn StepSource,
    options: &DiscoverOptions,
    fan: &FanOut,
) -> Result<Outcome<Discovery>> {
    let (step_ids, dangling) = match options.scope {
        DiscoverScope::Reachable => {
            let reach = reachable_steps(flow)?;
            (reach.order, reach.dangling)
        }
        DiscoverScope::AllSteps => (flow.nodes.keys().cloned().collect(), dangling_transitions(flow)),
    };

    let mut discovery = Discovery {
        flow_id: flow.id.clone(),
        step_ids,
        dangling,
        ..Discovery::default()
    };
    let mut errors = Vec::new();

    let mut targets = Vec::with_capacity(discovery.step_ids.len());
    for id in &discovery.step_ids {
        if let Some(entry) = flow.nodes.get(id) {
            discovery.dependencies.extend(classify_entry(entry));
            targets.push(ObjectRef::step(id.clone(), entry.node_type.clone()));
        }
    }

    let mut fetched = fetch_steps(source, targets, fan, &mut errors).await;
    let mut pending: Vec<(String, Vec<InnerStepRef>)> = Vec::new();
    for id in &discovery.step_ids {
        let Some(step) = fetched.remove(id) else {
            continue;
        };
        let node_type = flow
            .nodes
            .get(id)
            .map(|entry| entry.node_type.as_str())
            .unwrap_or_default();
        expand(node_type, &step, &mut discovery.dependencies, &mut pending);
        discovery.steps.insert(id.clone(), step);
    }

    // Descend one container level at a time; each container scopes its own
    // visited set, and an inner step is fetched once however often it recurs.
    while !pending.is_empty() {
        let mut targets = Vec::new();
        let mut order = Vec::new();
        for (container_id, refs) in pending.drain(..) {
            let mut seen: HashSet<String> = HashSet::new();
            let mut ids = Vec::new();
            for inner in refs {
                if !seen.insert(inner.id.clone()) {
                    continue;
                }
                ids.push(inner.id.clone());
                if discovery.inner_steps.contains_key(&inner.id)
                    || order.iter().any(|(id, _): &(String, String)| id == &inner.id)
                {
                    continue;
                }
                targets.push(ObjectRef::step(inner.id.clone(), inner.node_type.clone()));
                order.push((inner.id, inner.node_type));
            }
            discovery.containers.insert(container_id, ids);
        }

        let mut fetched = fetch_steps(source, targets, fan, &mut errors).await;
        for (id, node_type) in order {
            let Some(step) = fetched.remove(&id) else {
                continue;
            };
            expand(&node_type, &step, &mut discovery.dependencies, &mut pending);
            discovery.inner_steps.insert(id, step);
        }
    }

    debug!(
        flow = %flow.id,
        steps = discovery.steps.len(),
        inner_steps = discovery.inner_steps.len(),
        failures = errors.len(),
        "discovered flow"
    );
    Ok(Outcome::new(discovery, errors))
}

fn expand(
    node_type: &str,
    step: &StepDoc,
    dependencies: &mut DependencySet,
    pending: &mut Vec<(String, Vec<InnerStepRef>)>,
) {
    dependencies.extend(classify(node_type, step));
    let kind = StepKind::parse(step_type(step, node_type), &step.config);
    if kind.is_container() {
        pending.push((step.id.clone(), kind.inner_steps().to_vec()));
    }
}

async fn fetch_steps(
    source: &dyn StepSource,
    targets: Vec<ObjectRef>,
    fan: &FanOut,
    errors: &mut Vec<ObjectError>,
) -> HashMap<String, StepDoc> {
    let results = fan
        .run(targets, |target| async move { source.fetch_step(&target).await })
        .await;
    let mut fetched = HashMap::new();
    for (target, result) in results {
        match result {
            Ok(step) => {
                fetched.insert(target.id.clone(), step);
            }
            Err(err) => {
                warn!(step = %target.id, error = %err, "step body unavailable");
                errors.push(ObjectError::new(target, Operation::Read, err));
            }
        }
    }
    fetched
}
