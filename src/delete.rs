//! Flow removal with cross-flow reference counting, plus orphaned step cleanup.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::{
    engine::JourneyEngine,
    error::{ObjectError, Operation, Outcome, Result},
    model::StepDoc,
    step_kind::{Dependency, StepKind, step_type},
    store::{ObjectKind, ObjectRef},
    walker::{DiscoverScope, Discovery, LiveSteps},
};

const ENTITY_ID_FIELD: &str = "entityId";
const LOCATION_FIELD: &str = "location";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Also remove collaborator objects no other flow references.
    pub deep: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Still referenced by these flows.
    Shared { flows: Vec<String> },
    /// Some other flow could not be read, so sharing is unknown.
    CensusIncomplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub target: ObjectRef,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionSummary {
    pub flow_id: String,
    pub flow_deleted: bool,
    pub deleted: Vec<ObjectRef>,
    pub skipped: Vec<Skipped>,
}

impl DeletionSummary {
    fn skip(&mut self, target: ObjectRef, reason: SkipReason) {
        debug!(target = %target, ?reason, "left in place");
        self.skipped.push(Skipped { target, reason });
    }

    pub fn deleted_of(&self, kind: ObjectKind) -> impl Iterator<Item = &ObjectRef> {
        self.deleted.iter().filter(move |t| t.kind == kind)
    }

    pub fn skipped_of(&self, kind: ObjectKind) -> impl Iterator<Item = &Skipped> {
        self.skipped.iter().filter(move |s| s.target.kind == kind)
    }

    pub fn was_skipped(&self, kind: ObjectKind, id: &str) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| s.target.kind == kind && s.target.id == id)
            .map(|s| &s.reason)
    }
}

/// Which flows reference each step and each collaborator object.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCensus {
    steps: HashMap<String, BTreeSet<String>>,
    dependencies: HashMap<Dependency, BTreeSet<String>>,
    complete: bool,
}

impl ReferenceCensus {
    fn record(&mut self, discovery: &Discovery) {
        let flow = &discovery.flow_id;
        for id in discovery.step_ids.iter().chain(discovery.inner_step_ids()) {
            self.steps.entry(id.clone()).or_default().insert(flow.clone());
        }
        for dep in discovery.dependencies.iter() {
            self.dependencies.entry(dep).or_default().insert(flow.clone());
        }
    }

    /// False when at least one flow could not be fully walked.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn step_users(&self, step_id: &str) -> Vec<String> {
        self.steps
            .get(step_id)
            .map(|flows| flows.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flows referencing `dependency`. A flow that consults every social
    /// provider counts as a user of each one.
    pub fn users(&self, dependency: &Dependency) -> Vec<String> {
        let mut flows: BTreeSet<String> = self.dependencies.get(dependency).cloned().unwrap_or_default();
        if matches!(dependency, Dependency::SocialProvider(_))
            && let Some(any) = self.dependencies.get(&Dependency::AnySocialProvider)
        {
            flows.extend(any.iter().cloned());
        }
        flows.into_iter().collect()
    }
}

impl JourneyEngine {
    /// Walk every flow except `exclude` and count who references what.
    pub async fn reference_census(&self, exclude: &str, steps: &LiveSteps<'_>) -> ReferenceCensus {
        let listed = self.list_flows().await;
        let mut census = ReferenceCensus {
            complete: listed.is_complete(),
            ..ReferenceCensus::default()
        };
        for flow in listed.value.iter().filter(|flow| flow.id != exclude) {
            match self.discover_flow(flow, steps, DiscoverScope::AllSteps).await {
                Ok(found) => {
                    if !found.is_complete() {
                        census.complete = false;
                    }
                    census.record(&found.value);
                }
                Err(err) => {
                    warn!(flow = %flow.id, error = %err, "flow left out of reference census");
                    census.complete = false;
                }
            }
        }
        debug!(
            flows = listed.value.len(),
            complete = census.complete,
            "reference census built"
        );
        census
    }

    /// Delete a flow, then its steps, then (deep) the collaborators no other
    /// flow still uses.
    ///
    /// If the flow record itself cannot be deleted nothing else is touched.
    pub async fn delete_flow(&self, flow_id: &str, options: &DeleteOptions) -> Result<Outcome<DeletionSummary>> {
        let flow = self.read_flow(flow_id).await?;
        let steps = LiveSteps::new(self.store());
        let Outcome {
            value: discovery,
            mut errors,
        } = self
            .discover_flow(&flow, &steps, DiscoverScope::AllSteps)
            .await?;
        let census = if options.deep {
            Some(self.reference_census(flow_id, &steps).await)
        } else {
            None
        };

        let mut summary = DeletionSummary {
            flow_id: flow_id.to_string(),
            ..DeletionSummary::default()
        };
        let fan = self.fan();

        let (done, failures) = fan
            .delete_all(self.store(), vec![ObjectRef::flow(flow_id)])
            .await;
        if !failures.is_empty() {
            warn!(flow = %flow_id, "flow record not deleted; leaving its steps and dependencies");
            errors.extend(failures);
            return Ok(Outcome::new(summary, errors));
        }
        summary.flow_deleted = true;
        summary.deleted.extend(done);

        let mut outer = Vec::new();
        for id in &discovery.step_ids {
            let node_type = flow
                .nodes
                .get(id)
                .map(|entry| entry.node_type.as_str())
                .unwrap_or_default();
            let target = ObjectRef::step(id.clone(), node_type);
            match census.as_ref().map(|c| c.step_users(id)) {
                Some(flows) if !flows.is_empty() => summary.skip(target, SkipReason::Shared { flows }),
                _ => outer.push(target),
            }
        }
        let (done, failures) = fan.delete_all(self.store(), outer).await;
        summary.deleted.extend(done);
        errors.extend(failures);

        let mut inner = Vec::new();
        let mut seen = HashSet::new();
        for id in discovery.inner_step_ids() {
            if !seen.insert(id.as_str()) || discovery.steps.contains_key(id) {
                continue;
            }
            let mut target = ObjectRef::new(ObjectKind::Node, id.clone());
            if let Some(node_type) = discovery.inner_steps.get(id).and_then(StepDoc::type_id) {
                target = target.with_subtype(node_type);
            }
            match census.as_ref().map(|c| c.step_users(id)) {
                Some(flows) if !flows.is_empty() => summary.skip(target, SkipReason::Shared { flows }),
                _ => inner.push(target),
            }
        }
        let (done, failures) = fan.delete_all(self.store(), inner).await;
        summary.deleted.extend(done);
        errors.extend(failures);

        if let Some(census) = &census {
            let candidates = self
                .collaborator_targets(&discovery, &mut errors)
                .await;
            let mut exclusive = Vec::new();
            for (dependency, target) in candidates {
                if !census.is_complete() {
                    summary.skip(target, SkipReason::CensusIncomplete);
                    continue;
                }
                let flows = census.users(&dependency);
                if flows.is_empty() {
                    exclusive.push(target);
                } else {
                    summary.skip(target, SkipReason::Shared { flows });
                }
            }
            let (done, failures) = fan.delete_all(self.store(), exclusive).await;
            summary.deleted.extend(done);
            errors.extend(failures);
        }

        info!(
            flow = %flow_id,
            deleted = summary.deleted.len(),
            skipped = summary.skipped.len(),
            errors = errors.len(),
            "deleted flow"
        );
        Ok(Outcome::new(summary, errors))
    }

    /// Collaborator objects a flow references, addressed for deletion.
    /// Inner flows are never included.
    async fn collaborator_targets(
        &self,
        discovery: &Discovery,
        errors: &mut Vec<ObjectError>,
    ) -> Vec<(Dependency, ObjectRef)> {
        let deps = &discovery.dependencies;
        let mut targets = Vec::new();
        for id in &deps.scripts {
            targets.push((
                Dependency::Script(id.clone()),
                ObjectRef::new(ObjectKind::Script, id.clone()),
            ));
        }
        for id in &deps.email_templates {
            targets.push((
                Dependency::EmailTemplate(id.clone()),
                ObjectRef::new(ObjectKind::EmailTemplate, id.clone()),
            ));
        }
        for id in &deps.themes {
            targets.push((
                Dependency::Theme(id.clone()),
                ObjectRef::new(ObjectKind::Theme, id.clone()),
            ));
        }

        if !deps.social_providers.is_empty() {
            match self.store().list(ObjectKind::SocialIdentityProvider).await {
                Ok(providers) => {
                    let types: HashMap<&str, &str> = providers
                        .iter()
                        .filter_map(|p| {
                            let id = p.get("_id")?.as_str()?;
                            let kind = p.get("_type")?.get("_id")?.as_str()?;
                            Some((id, kind))
                        })
                        .collect();
                    for id in &deps.social_providers {
                        let mut target = ObjectRef::new(ObjectKind::SocialIdentityProvider, id.clone());
                        if let Some(kind) = types.get(id.as_str()) {
                            target = target.with_subtype(*kind);
                        }
                        targets.push((Dependency::SocialProvider(id.clone()), target));
                    }
                }
                Err(source) => errors.push(ObjectError::listing(ObjectKind::SocialIdentityProvider, source)),
            }
        }

        if !deps.saml2_entities.is_empty() {
            match self.store().list(ObjectKind::Saml2Entity).await {
                Ok(stubs) => {
                    for entity in &deps.saml2_entities {
                        let found = stubs.iter().find_map(|stub| {
                            if stub.get(ENTITY_ID_FIELD)?.as_str()? != entity.as_str() {
                                return None;
                            }
                            Some((
                                stub.get("_id")?.as_str()?.to_string(),
                                stub.get(LOCATION_FIELD)?.as_str()?.to_string(),
                            ))
                        });
                        match found {
                            Some((id, location)) => targets.push((
                                Dependency::Saml2Entity(entity.clone()),
                                ObjectRef::new(ObjectKind::Saml2Entity, id).with_subtype(location),
                            )),
                            None => debug!(entity = %entity, "SAML entity already absent"),
                        }
                    }
                }
                Err(source) => errors.push(ObjectError::listing(ObjectKind::Saml2Entity, source)),
            }
        }
        targets
    }

    /// Delete every flow in scope, one after another. Objects shared between
    /// flows go with the last flow that uses them.
    pub async fn delete_flows(&self, options: &DeleteOptions) -> Outcome<Vec<DeletionSummary>> {
        let Outcome {
            value: flows,
            mut errors,
        } = self.list_flows().await;
        let mut summaries = Vec::with_capacity(flows.len());
        for flow in flows {
            match self.delete_flow(&flow.id, options).await {
                Ok(deleted) => {
                    errors.extend(deleted.errors);
                    summaries.push(deleted.value);
                }
                Err(err) => {
                    warn!(flow = %flow.id, error = %err, "flow not deleted");
                    errors.push(ObjectError::flow(flow.id.clone(), Operation::Delete, err));
                }
            }
        }
        Outcome::new(summaries, errors)
    }

    /// Step objects that no flow references, directly or through a container.
    ///
    /// Returns nothing if any flow could not be read, since its steps would
    /// otherwise look orphaned.
    pub async fn find_orphaned_steps(&self) -> Outcome<Vec<ObjectRef>> {
        let listed = self.list_flows().await;
        if !listed.is_complete() {
            return Outcome::new(Vec::new(), listed.errors);
        }
        let bodies = match self.store().list(ObjectKind::Node).await {
            Ok(bodies) => bodies,
            Err(source) => {
                return Outcome::new(Vec::new(), vec![ObjectError::listing(ObjectKind::Node, source)]);
            }
        };

        let mut steps: BTreeMap<String, StepDoc> = BTreeMap::new();
        for body in bodies {
            match StepDoc::from_value(body) {
                Ok(step) => {
                    steps.insert(step.id.clone(), step);
                }
                Err(err) => warn!(error = %err, "skipping undecodable step"),
            }
        }

        let mut referenced: HashSet<String> = listed
            .value
            .iter()
            .flat_map(|flow| flow.nodes.keys().cloned())
            .collect();
        let mut frontier: Vec<String> = referenced.iter().cloned().collect();
        while let Some(id) = frontier.pop() {
            let Some(step) = steps.get(&id) else {
                continue;
            };
            let kind = StepKind::parse(step_type(step, ""), &step.config);
            for inner in kind.inner_steps() {
                if referenced.insert(inner.id.clone()) {
                    frontier.push(inner.id.clone());
                }
            }
        }

        let orphans: Vec<ObjectRef> = steps
            .values()
            .filter(|step| !referenced.contains(&step.id))
            .map(|step| match step.type_id() {
                Some(node_type) => ObjectRef::step(step.id.clone(), node_type),
                None => ObjectRef::new(ObjectKind::Node, step.id.clone()),
            })
            .collect();
        info!(orphans = orphans.len(), steps = steps.len(), "orphaned step scan");
        Outcome::complete(orphans)
    }

    /// Delete every orphaned step. Returns the steps actually removed.
    pub async fn remove_orphaned_steps(&self) -> Outcome<Vec<ObjectRef>> {
        let found = self.find_orphaned_steps().await;
        if found.value.is_empty() {
            return found;
        }
        let mut errors = found.errors;
        let (deleted, failures) = self.fan().delete_all(self.store(), found.value).await;
        errors.extend(failures);
        Outcome::new(deleted, errors)
    }
}
