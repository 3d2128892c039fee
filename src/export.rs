//! Bundle assembly: turn a discovered flow into a self-contained export.

use std::collections::{BTreeSet, HashSet};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    bundle::{ExportMeta, FlowBundle, MultiFlowExport, ScriptEncoding, encode_script},
    engine::JourneyEngine,
    error::{ObjectError, Operation, Outcome, Result, StoreError},
    fanout::FanOut,
    model::FlowDoc,
    store::{ObjectKind, ObjectRef, ObjectStore},
    walker::{DiscoverScope, Discovery, LiveSteps},
};

const TRANSFORM_FIELD: &str = "transform";
const ENTITY_ID_FIELD: &str = "entityId";
const LOCATION_FIELD: &str = "location";
const TRUSTED_PROVIDERS_FIELD: &str = "trustedProviders";
const STATIC_NODES_FIELD: &str = "staticNodes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Include collaborator objects; `false` exports only the flow and its steps.
    pub deps: bool,
    /// Keep step coordinates used for visualization.
    pub coords: bool,
    pub script_encoding: ScriptEncoding,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            deps: true,
            coords: true,
            script_encoding: ScriptEncoding::Blob,
        }
    }
}

impl JourneyEngine {
    /// Export one flow with everything reachable from its entry step.
    pub async fn export_flow(&self, flow_id: &str, options: &ExportOptions) -> Result<Outcome<FlowBundle>> {
        let flow = self.read_flow(flow_id).await?;
        let steps = LiveSteps::new(self.store());
        let discovered = self
            .discover_flow(&flow, &steps, DiscoverScope::Reachable)
            .await?;
        let Outcome {
            value: discovery,
            mut errors,
        } = discovered;

        let meta = ExportMeta::now(self.config().origin.clone(), self.config().exported_by.clone());
        let assembled = assemble(self.store(), &self.fan(), &flow, discovery, options, Some(meta)).await;
        errors.extend(assembled.errors);
        info!(
            flow = %flow_id,
            steps = assembled.value.nodes.len(),
            inner_steps = assembled.value.inner_nodes.len(),
            errors = errors.len(),
            "exported flow"
        );
        Ok(Outcome::new(assembled.value, errors))
    }

    /// Export every flow in scope into one document. A flow that cannot be
    /// walked is reported and left out.
    pub async fn export_flows(&self, options: &ExportOptions) -> Outcome<MultiFlowExport> {
        let Outcome {
            value: flows,
            mut errors,
        } = self.list_flows().await;
        let mut bundles = Vec::with_capacity(flows.len());
        for flow in flows {
            match self.export_flow(&flow.id, options).await {
                Ok(exported) => {
                    errors.extend(exported.errors);
                    bundles.push(exported.value);
                }
                Err(err) => {
                    warn!(flow = %flow.id, error = %err, "flow left out of export");
                    errors.push(ObjectError::flow(flow.id.clone(), Operation::Read, err));
                }
            }
        }
        let meta = ExportMeta::now(self.config().origin.clone(), self.config().exported_by.clone());
        Outcome::new(MultiFlowExport::new(Some(meta), bundles), errors)
    }
}

/// Fetch every dependency in `discovery` and package it with the flow.
///
/// Objects that cannot be fetched are left out of the bundle and reported.
pub async fn assemble(
    store: &dyn ObjectStore,
    fan: &FanOut,
    flow: &FlowDoc,
    discovery: Discovery,
    options: &ExportOptions,
    meta: Option<ExportMeta>,
) -> Outcome<FlowBundle> {
    let mut bundle = FlowBundle::new(export_tree(flow, &discovery, options.coords));
    bundle.meta = meta;
    bundle.nodes = discovery.steps;
    bundle.inner_nodes = discovery.inner_steps;
    let mut errors = Vec::new();

    if !options.deps {
        return Outcome::new(bundle, errors);
    }
    let deps = discovery.dependencies;
    let mut scripts: BTreeSet<String> = deps.scripts.clone();

    if deps.any_social_provider || !deps.social_providers.is_empty() {
        match store.list(ObjectKind::SocialIdentityProvider).await {
            Ok(providers) => {
                let mut found = HashSet::new();
                for provider in providers {
                    let Some(id) = object_id(&provider) else {
                        continue;
                    };
                    if !deps.any_social_provider && !deps.social_providers.contains(&id) {
                        continue;
                    }
                    if let Some(script) = provider.get(TRANSFORM_FIELD).and_then(Value::as_str)
                        && !script.is_empty()
                    {
                        scripts.insert(script.to_string());
                    }
                    found.insert(id.clone());
                    bundle.social_identity_providers.insert(id, provider);
                }
                for missing in deps.social_providers.iter().filter(|id| !found.contains(*id)) {
                    errors.push(ObjectError::new(
                        ObjectRef::new(ObjectKind::SocialIdentityProvider, missing.clone()),
                        Operation::Read,
                        StoreError::NotFound,
                    ));
                }
            }
            Err(source) => errors.push(ObjectError::listing(ObjectKind::SocialIdentityProvider, source)),
        }
    }

    // SAML entities are referenced by entity id but addressed by their own id and location.
    let mut entity_ids: IndexMap<String, String> = IndexMap::new();
    let mut targets = Vec::new();
    if !deps.saml2_entities.is_empty() {
        match store.list(ObjectKind::Saml2Entity).await {
            Ok(stubs) => {
                for entity in &deps.saml2_entities {
                    let stub = stubs
                        .iter()
                        .find(|stub| stub.get(ENTITY_ID_FIELD).and_then(Value::as_str) == Some(entity.as_str()));
                    let Some((id, location)) = stub.and_then(|stub| {
                        Some((
                            object_id(stub)?,
                            stub.get(LOCATION_FIELD).and_then(Value::as_str)?.to_string(),
                        ))
                    }) else {
                        errors.push(ObjectError::new(
                            ObjectRef::new(ObjectKind::Saml2Entity, entity.clone()),
                            Operation::Read,
                            StoreError::NotFound,
                        ));
                        continue;
                    };
                    targets.push(ObjectRef::new(ObjectKind::Saml2Entity, id.clone()).with_subtype(location));
                    targets.push(ObjectRef::new(ObjectKind::Saml2Metadata, id.clone()));
                    entity_ids.insert(id, entity.clone());
                }
            }
            Err(source) => errors.push(ObjectError::listing(ObjectKind::Saml2Entity, source)),
        }
    }

    targets.extend(scripts.iter().map(|id| ObjectRef::new(ObjectKind::Script, id.clone())));
    targets.extend(
        deps.email_templates
            .iter()
            .map(|id| ObjectRef::new(ObjectKind::EmailTemplate, id.clone())),
    );
    targets.extend(deps.themes.iter().map(|id| ObjectRef::new(ObjectKind::Theme, id.clone())));

    let (bodies, failures) = fan.read_all(store, targets).await;
    errors.extend(failures);
    for (target, mut body) in bodies {
        match target.kind {
            ObjectKind::Script => {
                encode_script(&mut body, options.script_encoding);
                bundle.scripts.insert(target.id, body);
            }
            ObjectKind::EmailTemplate => {
                bundle.email_templates.insert(target.id, body);
            }
            ObjectKind::Theme => bundle.themes.push(body),
            ObjectKind::Saml2Entity => {
                if target.subtype.as_deref() == Some("remote") {
                    bundle.saml2_entities.remote.insert(target.id, body);
                } else {
                    bundle.saml2_entities.hosted.insert(target.id, body);
                }
            }
            ObjectKind::Saml2Metadata => {
                bundle.saml2_entities.metadata.insert(target.id, body);
            }
            other => debug!(kind = %other, id = %target.id, "unexpected dependency body ignored"),
        }
    }

    if !entity_ids.is_empty() {
        match store.list(ObjectKind::CircleOfTrust).await {
            Ok(circles) => {
                let wanted: HashSet<&str> = entity_ids.values().map(String::as_str).collect();
                for circle in circles {
                    let Some(id) = object_id(&circle) else {
                        continue;
                    };
                    if trusts_any(&circle, &wanted) {
                        bundle.circles_of_trust.insert(id, circle);
                    }
                }
            }
            Err(source) => errors.push(ObjectError::listing(ObjectKind::CircleOfTrust, source)),
        }
    }

    Outcome::new(bundle, errors)
}

/// The flow record restricted to the steps the traversal covered.
fn export_tree(flow: &FlowDoc, discovery: &Discovery, coords: bool) -> FlowDoc {
    let covered: HashSet<&str> = discovery.step_ids.iter().map(String::as_str).collect();
    let mut tree = flow.clone();
    tree.nodes.retain(|id, _| covered.contains(id.as_str()));
    if !coords {
        for entry in tree.nodes.values_mut() {
            entry.strip_coordinates();
        }
        if let Some(Value::Object(statics)) = tree.extra.get_mut(STATIC_NODES_FIELD) {
            for node in statics.values_mut() {
                if let Value::Object(node) = node {
                    node.remove("x");
                    node.remove("y");
                }
            }
        }
    }
    tree
}

fn object_id(body: &Value) -> Option<String> {
    body.get("_id").and_then(Value::as_str).map(str::to_string)
}

/// Whether a circle of trust lists any of `entities`. Entries look like `<entityId>|saml2`.
fn trusts_any(circle: &Value, entities: &HashSet<&str>) -> bool {
    circle
        .get(TRUSTED_PROVIDERS_FIELD)
        .and_then(Value::as_array)
        .map(|providers| {
            providers.iter().filter_map(Value::as_str).any(|provider| {
                let entity = provider.split('|').next().unwrap_or(provider);
                entities.contains(entity)
            })
        })
        .unwrap_or(false)
}
