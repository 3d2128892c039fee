use std::collections::HashMap;

use blake3::Hasher;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{FlowError, Result},
    model::{FlowDoc, StepDoc},
    step_kind::{StepKind, step_type},
};

const INLINE_SOURCE_LABEL: &str = "<inline>";
const REQUIRED_GROUPS: [&str; 4] = ["tree", "nodes", "innerNodes", "scripts"];
const SCRIPT_BODY_FIELD: &str = "script";

/// Provenance of an export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_by: Option<String>,
    pub export_date: String,
    pub export_tool: String,
    pub export_tool_version: String,
}

impl ExportMeta {
    pub fn now(origin: Option<String>, exported_by: Option<String>) -> Self {
        ExportMeta {
            origin,
            exported_by,
            export_date: chrono::Utc::now().to_rfc3339(),
            export_tool: env!("CARGO_PKG_NAME").to_string(),
            export_tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// SAML entity providers split by location, plus their metadata documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Saml2Entities {
    #[serde(default)]
    pub hosted: IndexMap<String, Value>,
    #[serde(default)]
    pub remote: IndexMap<String, Value>,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
}

impl Saml2Entities {
    pub fn is_empty(&self) -> bool {
        self.hosted.is_empty() && self.remote.is_empty() && self.metadata.is_empty()
    }

    /// Entity bodies of both locations, tagged with their location.
    pub fn entities(&self) -> impl Iterator<Item = (&'static str, &String, &Value)> {
        self.hosted
            .iter()
            .map(|(id, body)| ("hosted", id, body))
            .chain(self.remote.iter().map(|(id, body)| ("remote", id, body)))
    }
}

/// Self-contained export of one flow and everything it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ExportMeta>,
    pub tree: FlowDoc,
    pub nodes: IndexMap<String, StepDoc>,
    pub inner_nodes: IndexMap<String, StepDoc>,
    pub scripts: IndexMap<String, Value>,
    #[serde(default)]
    pub email_templates: IndexMap<String, Value>,
    #[serde(default)]
    pub saml2_entities: Saml2Entities,
    #[serde(default)]
    pub circles_of_trust: IndexMap<String, Value>,
    #[serde(default)]
    pub social_identity_providers: IndexMap<String, Value>,
    #[serde(default)]
    pub themes: Vec<Value>,
}

impl FlowBundle {
    /// A bundle holding only the flow record; steps and dependencies are added by the caller.
    pub fn new(tree: FlowDoc) -> Self {
        FlowBundle {
            meta: None,
            tree,
            nodes: IndexMap::new(),
            inner_nodes: IndexMap::new(),
            scripts: IndexMap::new(),
            email_templates: IndexMap::new(),
            saml2_entities: Saml2Entities::default(),
            circles_of_trust: IndexMap::new(),
            social_identity_providers: IndexMap::new(),
            themes: Vec::new(),
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.tree.id
    }

    /// Node type of every outer and inner step, keyed by step id. A body's own
    /// `_type` wins; otherwise the flow entry or the declaring container
    /// supplies it, at any nesting depth.
    pub fn step_types(&self) -> HashMap<String, String> {
        let mut declared: HashMap<String, String> = self
            .tree
            .nodes
            .iter()
            .map(|(id, entry)| (id.clone(), entry.node_type.clone()))
            .collect();
        // a nested container declares its inner types only once its own type is known
        loop {
            let mut changed = false;
            for (id, step) in self.nodes.iter().chain(self.inner_nodes.iter()) {
                let fallback = declared.get(id).map(String::as_str).unwrap_or_default();
                let kind = StepKind::parse(step_type(step, fallback), &step.config);
                for inner in kind.inner_steps() {
                    if !declared.contains_key(&inner.id) {
                        declared.insert(inner.id.clone(), inner.node_type.clone());
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        self.nodes
            .iter()
            .chain(self.inner_nodes.iter())
            .map(|(id, step)| {
                let fallback = declared.get(id).map(String::as_str).unwrap_or_default();
                (id.clone(), step_type(step, fallback).to_string())
            })
            .collect()
    }

    /// True when no collaborator object is carried.
    pub fn has_no_dependencies(&self) -> bool {
        self.scripts.is_empty()
            && self.email_templates.is_empty()
            && self.saml2_entities.is_empty()
            && self.circles_of_trust.is_empty()
            && self.social_identity_providers.is_empty()
            && self.themes.is_empty()
    }

    /// BLAKE3 digest of the canonical JSON form, ignoring `meta`.
    pub fn digest(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("meta");
        }
        let canonical = canonicalize_json(&value);
        blake3_hex(serde_json::to_vec(&canonical).unwrap_or_default())
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FlowError::Internal {
            message: format!("bundle serialization: {e}"),
        })
    }
}

/// Several flows exported together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiFlowExport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ExportMeta>,
    pub trees: IndexMap<String, FlowBundle>,
}

impl MultiFlowExport {
    pub fn new(meta: Option<ExportMeta>, bundles: Vec<FlowBundle>) -> Self {
        let trees = bundles
            .into_iter()
            .map(|mut bundle| {
                bundle.meta = None;
                (bundle.tree.id.clone(), bundle)
            })
            .collect();
        MultiFlowExport { meta, trees }
    }
}

/// Parse a single-flow export document.
pub fn parse_bundle(text: &str) -> Result<FlowBundle> {
    parse_bundle_with_source(text, INLINE_SOURCE_LABEL)
}

pub fn parse_bundle_with_source(text: &str, source_label: &str) -> Result<FlowBundle> {
    let value = parse_json(text, source_label)?;
    bundle_from_value(value, source_label)
}

/// Parse either a single-flow or a multi-flow document into its bundles.
pub fn parse_document(text: &str, source_label: &str) -> Result<Vec<FlowBundle>> {
    let value = parse_json(text, source_label)?;
    let Some(trees) = value.get("trees") else {
        return Ok(vec![bundle_from_value(value, source_label)?]);
    };
    let Value::Object(trees) = trees else {
        return Err(FlowError::Json {
            source_label: source_label.to_string(),
            message: "'trees' must be an object keyed by flow id".to_string(),
        });
    };
    let meta = value.get("meta").cloned();
    let mut bundles = Vec::with_capacity(trees.len());
    for (id, tree_bundle) in trees {
        let mut bundle = bundle_from_value(tree_bundle.clone(), &format!("{source_label}#{id}"))?;
        if bundle.meta.is_none() {
            bundle.meta = meta
                .clone()
                .and_then(|meta| serde_json::from_value(meta).ok());
        }
        bundles.push(bundle);
    }
    Ok(bundles)
}

fn parse_json(text: &str, source_label: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| FlowError::Json {
        source_label: source_label.to_string(),
        message: e.to_string(),
    })
}

fn bundle_from_value(value: Value, source_label: &str) -> Result<FlowBundle> {
    let Value::Object(map) = &value else {
        return Err(FlowError::Json {
            source_label: source_label.to_string(),
            message: "export document must be a JSON object".to_string(),
        });
    };
    for group in REQUIRED_GROUPS {
        if !map.contains_key(group) {
            return Err(FlowError::MissingGroup { group });
        }
    }
    serde_json::from_value(value).map_err(|e| FlowError::Json {
        source_label: source_label.to_string(),
        message: e.to_string(),
    })
}

/// How multi-line script bodies are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptEncoding {
    /// One string with embedded newlines.
    #[default]
    Blob,
    /// One string per line.
    Lines,
}

/// Rewrite a script body's source into the requested encoding.
pub fn encode_script(body: &mut Value, encoding: ScriptEncoding) {
    let Some(source) = body.get_mut(SCRIPT_BODY_FIELD) else {
        return;
    };
    let text = script_text(source);
    let Some(text) = text else {
        return;
    };
    *source = match encoding {
        ScriptEncoding::Blob => Value::String(text),
        ScriptEncoding::Lines => Value::Array(
            text.split('\n')
                .map(|line| Value::String(line.to_string()))
                .collect(),
        ),
    };
}

fn script_text(source: &Value) -> Option<String> {
    match source {
        Value::String(text) => Some(text.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .map(|line| line.as_str().unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

/// Canonicalize a JSON value by sorting object keys recursively.
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut ordered = Map::with_capacity(map.len());
            for key in keys {
                ordered.insert(key.clone(), canonicalize_json(&map[key]));
            }
            Value::Object(ordered)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

/// Compute a lowercase hex-encoded BLAKE3 hash for the provided bytes.
pub fn blake3_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Hasher::new();
    hasher.update(bytes.as_ref());
    hasher.finalize().to_hex().to_string()
}
