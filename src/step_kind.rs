//! Step type catalog and dependency classification.
//!
//! Every step type that references a shared object is listed here with the
//! field that holds the reference. Anything not in the catalog is opaque and
//! contributes no dependencies.

use serde_json::{Map, Value};

use crate::model::{InnerStepRef, NodeEntry, StepDoc};

pub const PAGE_NODE: &str = "PageNode";
pub const INNER_TREE_NODE: &str = "InnerTreeEvaluatorNode";

const SCRIPT_FIELD: &str = "script";
const EMAIL_TEMPLATE_FIELD: &str = "emailTemplateName";
const SAML_ENTITY_FIELD: &str = "idp";
const FILTERED_PROVIDERS_FIELD: &str = "filteredProviders";
const INNER_NODES_FIELD: &str = "nodes";
const INNER_TREE_FIELD: &str = "tree";
const STAGE_FIELD: &str = "stage";
const THEME_ID_FIELD: &str = "themeId";

/// A directed reference from a step to something it does not own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    Script(String),
    EmailTemplate(String),
    Saml2Entity(String),
    SocialProvider(String),
    /// The step consults every social identity provider configured in the realm.
    AnySocialProvider,
    Theme(String),
    /// Another flow evaluated as a sub-journey.
    InnerFlow(String),
}

/// Typed view of a step configuration, by type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Scripted {
        script: Option<String>,
    },
    EmailTemplate {
        template: Option<String>,
    },
    Saml2 {
        entity: Option<String>,
    },
    SocialProviderHandler {
        script: Option<String>,
    },
    SelectIdentityProvider {
        providers: Vec<String>,
    },
    /// Container step embedding an ordered list of inner steps.
    Page {
        inner: Vec<InnerStepRef>,
    },
    InnerFlow {
        flow: Option<String>,
    },
    Opaque(String),
}

impl StepKind {
    /// Parse the dependency-bearing fields of `config` according to `node_type`.
    pub fn parse(node_type: &str, config: &Map<String, Value>) -> StepKind {
        match node_type {
            "ScriptedDecisionNode" | "ClientScriptNode" | "CustomScriptNode"
            | "ConfigProviderNode" => StepKind::Scripted {
                script: string_field(config, SCRIPT_FIELD),
            },
            "SocialProviderHandlerNode" | "SocialProviderHandlerNodeV2" => {
                StepKind::SocialProviderHandler {
                    script: string_field(config, SCRIPT_FIELD),
                }
            }
            "SelectIdPNode" => StepKind::SelectIdentityProvider {
                providers: config
                    .get(FILTERED_PROVIDERS_FIELD)
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "EmailSuspendNode" | "EmailTemplateNode" => StepKind::EmailTemplate {
                template: string_field(config, EMAIL_TEMPLATE_FIELD),
            },
            "product-Saml2Node" => StepKind::Saml2 {
                entity: string_field(config, SAML_ENTITY_FIELD),
            },
            PAGE_NODE => StepKind::Page {
                inner: inner_refs(config),
            },
            INNER_TREE_NODE => StepKind::InnerFlow {
                flow: string_field(config, INNER_TREE_FIELD),
            },
            other => StepKind::Opaque(other.to_string()),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, StepKind::Page { .. })
    }

    pub fn inner_steps(&self) -> &[InnerStepRef] {
        match self {
            StepKind::Page { inner } => inner,
            _ => &[],
        }
    }

    fn dependencies(&self) -> Vec<Dependency> {
        match self {
            StepKind::Scripted { script } => script.iter().cloned().map(Dependency::Script).collect(),
            StepKind::EmailTemplate { template } => template
                .iter()
                .cloned()
                .map(Dependency::EmailTemplate)
                .collect(),
            StepKind::Saml2 { entity } => {
                entity.iter().cloned().map(Dependency::Saml2Entity).collect()
            }
            StepKind::SocialProviderHandler { script } => {
                let mut deps = vec![Dependency::AnySocialProvider];
                deps.extend(script.iter().cloned().map(Dependency::Script));
                deps
            }
            StepKind::SelectIdentityProvider { providers } => providers
                .iter()
                .cloned()
                .map(Dependency::SocialProvider)
                .collect(),
            StepKind::InnerFlow { flow } => flow.iter().cloned().map(Dependency::InnerFlow).collect(),
            StepKind::Page { .. } | StepKind::Opaque(_) => Vec::new(),
        }
    }
}

fn string_field(config: &Map<String, Value>, field: &str) -> Option<String> {
    config
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn inner_refs(config: &Map<String, Value>) -> Vec<InnerStepRef> {
    config
        .get(INNER_NODES_FIELD)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Extract a theme id from a `stage` block. The block is either an object or a
/// string holding JSON; plain labels carry no theme.
pub fn stage_theme(stage: Option<&Value>) -> Option<String> {
    let parsed;
    let object = match stage? {
        Value::Object(map) => map,
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).ok()?;
            parsed.as_object()?
        }
        _ => return None,
    };
    object
        .get(THEME_ID_FIELD)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolve the type tag of a step, preferring the body's own `_type`.
pub fn step_type<'a>(step: &'a StepDoc, fallback: &'a str) -> &'a str {
    step.type_id().unwrap_or(fallback)
}

/// Every dependency a step references, including its theme.
pub fn classify(node_type: &str, step: &StepDoc) -> Vec<Dependency> {
    let kind = StepKind::parse(step_type(step, node_type), &step.config);
    let mut deps = kind.dependencies();
    if let Some(theme) = stage_theme(step.config.get(STAGE_FIELD)) {
        deps.push(Dependency::Theme(theme));
    }
    deps
}

/// Dependencies carried on the flow's own entry for a step (its `stage` block).
pub fn classify_entry(entry: &NodeEntry) -> Vec<Dependency> {
    stage_theme(entry.extra.get(STAGE_FIELD))
        .map(Dependency::Theme)
        .into_iter()
        .collect()
}
