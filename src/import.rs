//! Re-create a bundle in a target environment, dependency tier first.
//!
//! Order: shared objects, then inner steps, then outer steps, then the flow
//! record. A failed object never stops its siblings, and nothing already
//! written is rolled back.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    bundle::{FlowBundle, ScriptEncoding, encode_script},
    engine::JourneyEngine,
    error::{FlowError, ObjectError, Operation, Outcome, Result, StoreError},
    model::{StepDoc, strip_revision},
    rewrite::{RemapTable, rewrite},
    step_kind::{Dependency, StepKind, classify},
    store::{ObjectKind, ObjectRef, ObjectStore},
    walker::{DanglingTransition, dangling_transitions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Write the bundle's shared objects as well as the flow and its steps.
    pub deps: bool,
    /// Give every step a fresh id before writing.
    pub re_uuid: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            deps: true,
            re_uuid: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    Created,
    Updated,
}

/// Steps were written but the flow record itself was not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteFlow {
    pub steps_written: usize,
    pub error: ObjectError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub flow_id: String,
    pub created: BTreeMap<ObjectKind, usize>,
    pub updated: BTreeMap<ObjectKind, usize>,
    /// Present when step ids were regenerated.
    pub remap: Option<RemapTable>,
    pub dangling: Vec<DanglingTransition>,
    pub incomplete_flow: Option<IncompleteFlow>,
}

impl ImportSummary {
    fn record(&mut self, kind: ObjectKind, written: Written) {
        let counts = match written {
            Written::Created => &mut self.created,
            Written::Updated => &mut self.updated,
        };
        *counts.entry(kind).or_default() += 1;
    }

    pub fn written(&self, kind: ObjectKind) -> usize {
        self.created.get(&kind).copied().unwrap_or(0) + self.updated.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_written(&self) -> usize {
        self.created.values().sum::<usize>() + self.updated.values().sum::<usize>()
    }

    /// True once the flow record itself has been written.
    pub fn flow_written(&self) -> bool {
        self.written(ObjectKind::Flow) > 0
    }
}

/// Check that a bundle can be imported without dangling step references.
///
/// Returns the dangling transitions, which are tolerated but worth a warning.
pub fn validate_bundle(bundle: &FlowBundle) -> Result<Vec<DanglingTransition>> {
    let flow = &bundle.tree;
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
    for id in flow.nodes.keys() {
        if !bundle.nodes.contains_key(id) {
            return Err(FlowError::MissingStepBody {
                flow_id: flow.id.clone(),
                step_id: id.clone(),
            });
        }
    }
    let types = bundle.step_types();
    for (container_id, step) in bundle.nodes.iter().chain(bundle.inner_nodes.iter()) {
        let node_type = types.get(container_id).map(String::as_str).unwrap_or_default();
        let kind = StepKind::parse(node_type, &step.config);
        for inner in kind.inner_steps() {
            if !bundle.inner_nodes.contains_key(&inner.id) {
                return Err(FlowError::MissingInnerStepBody {
                    flow_id: flow.id.clone(),
                    container_id: container_id.clone(),
                    inner_id: inner.id.clone(),
                });
            }
        }
    }
    let dangling = dangling_transitions(flow);
    for d in &dangling {
        warn!(
            flow = %flow.id,
            step = %d.from,
            outcome = %d.outcome,
            target = %d.target,
            "bundle carries a transition to a missing step"
        );
    }
    Ok(dangling)
}

/// Flows referenced by inner-flow steps anywhere in the bundle.
pub fn inner_flow_references(bundle: &FlowBundle) -> BTreeSet<String> {
    let mut flows = BTreeSet::new();
    let types = bundle.step_types();
    for (id, step) in bundle.nodes.iter().chain(bundle.inner_nodes.iter()) {
        let node_type = types.get(id).map(String::as_str).unwrap_or_default();
        for dep in classify(node_type, step) {
            if let Dependency::InnerFlow(flow) = dep {
                flows.insert(flow);
            }
        }
    }
    flows
}

/// Order bundles so that a flow used as a sub-journey is written before the
/// flows that evaluate it. Cycles keep their document order.
pub fn import_order(bundles: &[FlowBundle]) -> Vec<usize> {
    let index: HashMap<&str, usize> = bundles
        .iter()
        .enumerate()
        .map(|(i, b)| (b.flow_id(), i))
        .collect();
    let mut indegree = vec![0usize; bundles.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); bundles.len()];
    for (i, bundle) in bundles.iter().enumerate() {
        for inner in inner_flow_references(bundle) {
            if let Some(&j) = index.get(inner.as_str())
                && j != i
            {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..bundles.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(bundles.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                queue.push_back(d);
            }
        }
    }
    if order.len() < bundles.len() {
        warn!("inner flow references form a cycle; importing the rest in document order");
        for i in 0..bundles.len() {
            if !order.contains(&i) {
                order.push(i);
            }
        }
    }
    order
}

async fn upsert(
    store: &dyn ObjectStore,
    target: &ObjectRef,
    body: &Value,
) -> std::result::Result<Written, (Operation, StoreError)> {
    match store.update(target, body).await {
        Ok(_) => Ok(Written::Updated),
        Err(StoreError::NotFound) => store
            .create(target, body)
            .await
            .map(|_| Written::Created)
            .map_err(|e| (Operation::Create, e)),
        Err(e) => Err((Operation::Update, e)),
    }
}

fn step_body(step: &StepDoc) -> Value {
    let mut body = step.to_value();
    strip_revision(&mut body);
    body
}

fn owned_body(body: &Value) -> Value {
    let mut body = body.clone();
    strip_revision(&mut body);
    body
}

fn type_of(body: &Value) -> Option<String> {
    body.get("_type")
        .and_then(|t| t.get("_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl JourneyEngine {
    /// Write one phase of objects concurrently, recording counts and failures.
    async fn write_phase(
        &self,
        phase: &str,
        writes: Vec<(ObjectRef, Value)>,
        summary: &mut ImportSummary,
        errors: &mut Vec<ObjectError>,
    ) -> usize {
        if writes.is_empty() {
            return 0;
        }
        let bodies: HashMap<ObjectRef, Value> = writes.into_iter().collect();
        let targets: Vec<ObjectRef> = bodies.keys().cloned().collect();
        let store = self.store();
        let bodies = &bodies;
        let results = self
            .fan()
            .run(targets, |target| async move {
                let body = bodies.get(&target).cloned().unwrap_or(Value::Null);
                Ok(upsert(store, &target, &body).await)
            })
            .await;

        let mut ok = 0;
        for (target, result) in results {
            match result {
                Ok(Ok(written)) => {
                    summary.record(target.kind, written);
                    ok += 1;
                }
                Ok(Err((operation, source))) => {
                    warn!(phase, target = %target, error = %source, "import write failed");
                    errors.push(ObjectError::new(target, operation, source));
                }
                Err(source) => errors.push(ObjectError::new(target, Operation::Update, source)),
            }
        }
        debug!(phase, written = ok, "import phase finished");
        ok
    }

    /// Import one bundle.
    pub async fn import_flow(&self, bundle: &FlowBundle, options: &ImportOptions) -> Result<Outcome<ImportSummary>> {
        let dangling = validate_bundle(bundle)?;
        let (bundle, remap) = if options.re_uuid {
            let (rewritten, table) = rewrite(bundle);
            (rewritten, Some(table))
        } else {
            (bundle.clone(), None)
        };

        let mut summary = ImportSummary {
            flow_id: bundle.tree.id.clone(),
            remap,
            dangling,
            ..ImportSummary::default()
        };
        let mut errors = Vec::new();

        if options.deps {
            let mut leaves = Vec::new();
            for (id, body) in &bundle.scripts {
                let mut body = owned_body(body);
                encode_script(&mut body, ScriptEncoding::Blob);
                leaves.push((ObjectRef::new(ObjectKind::Script, id.clone()), body));
            }
            for (id, body) in &bundle.email_templates {
                leaves.push((ObjectRef::new(ObjectKind::EmailTemplate, id.clone()), owned_body(body)));
            }
            for theme in &bundle.themes {
                match theme.get("_id").and_then(Value::as_str) {
                    Some(id) => leaves.push((ObjectRef::new(ObjectKind::Theme, id), owned_body(theme))),
                    None => warn!(flow = %bundle.tree.id, "theme without _id skipped"),
                }
            }
            for (location, id, body) in bundle.saml2_entities.entities() {
                leaves.push((
                    ObjectRef::new(ObjectKind::Saml2Entity, id.clone()).with_subtype(location),
                    owned_body(body),
                ));
            }
            for (id, body) in &bundle.saml2_entities.metadata {
                leaves.push((ObjectRef::new(ObjectKind::Saml2Metadata, id.clone()), owned_body(body)));
            }
            self.write_phase("shared objects", leaves, &mut summary, &mut errors)
                .await;

            // These reference objects of the previous tier (transform scripts, SAML entities).
            let mut linked = Vec::new();
            for (id, body) in &bundle.social_identity_providers {
                let mut target = ObjectRef::new(ObjectKind::SocialIdentityProvider, id.clone());
                if let Some(provider_type) = type_of(body) {
                    target = target.with_subtype(provider_type);
                }
                linked.push((target, owned_body(body)));
            }
            for (id, body) in &bundle.circles_of_trust {
                linked.push((ObjectRef::new(ObjectKind::CircleOfTrust, id.clone()), owned_body(body)));
            }
            self.write_phase("linked shared objects", linked, &mut summary, &mut errors)
                .await;
        }

        let types = bundle.step_types();
        let type_of_step =
            |id: &str| types.get(id).map(String::as_str).unwrap_or_default().to_string();
        let inner = bundle
            .inner_nodes
            .iter()
            .map(|(id, step)| {
                (
                    ObjectRef::step(id.clone(), type_of_step(id.as_str())),
                    step_body(step),
                )
            })
            .collect();
        let mut steps_written = self
            .write_phase("inner steps", inner, &mut summary, &mut errors)
            .await;

        let outer = bundle
            .nodes
            .iter()
            .map(|(id, step)| {
                (
                    ObjectRef::step(id.clone(), type_of_step(id.as_str())),
                    step_body(step),
                )
            })
            .collect();
        steps_written += self
            .write_phase("steps", outer, &mut summary, &mut errors)
            .await;

        let mut flow_body = serde_json::to_value(&bundle.tree).map_err(|e| FlowError::Internal {
            message: format!("flow serialization: {e}"),
        })?;
        strip_revision(&mut flow_body);
        let before = errors.len();
        self.write_phase(
            "flow",
            vec![(ObjectRef::flow(bundle.tree.id.clone()), flow_body)],
            &mut summary,
            &mut errors,
        )
        .await;
        if errors.len() > before {
            let error = errors[before].clone();
            warn!(
                flow = %bundle.tree.id,
                steps_written,
                error = %error,
                "flow record not written; its steps stay in place"
            );
            summary.incomplete_flow = Some(IncompleteFlow {
                steps_written,
                error,
            });
        }

        info!(
            flow = %summary.flow_id,
            written = summary.total_written(),
            errors = errors.len(),
            "imported flow"
        );
        Ok(Outcome::new(summary, errors))
    }

    /// Import several bundles, sub-journeys first. Every bundle is validated
    /// before anything is written.
    pub async fn import_flows(
        &self,
        bundles: &[FlowBundle],
        options: &ImportOptions,
    ) -> Result<Outcome<Vec<ImportSummary>>> {
        for bundle in bundles {
            validate_bundle(bundle)?;
        }
        let mut summaries = Vec::with_capacity(bundles.len());
        let mut errors = Vec::new();
        for i in import_order(bundles) {
            let imported = self.import_flow(&bundles[i], options).await?;
            errors.extend(imported.errors);
            summaries.push(imported.value);
        }
        Ok(Outcome::new(summaries, errors))
    }
}
