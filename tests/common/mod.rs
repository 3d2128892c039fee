#![allow(dead_code)]

use std::{fs, sync::Arc};

use journey_bundle::{
    EngineConfig, FlowBundle, FlowDoc, JourneyEngine, MemoryStore, NodeEntry, ObjectKind, StepDoc,
    model::SUCCESS_NODE_ID, parse_bundle,
};
use serde_json::{Value, json};

pub const FRODO_TEST: &str = "fixtures/FrodoTest.journey.json";

pub fn frodo_bundle() -> FlowBundle {
    let text = fs::read_to_string(FRODO_TEST).expect("read fixture");
    parse_bundle(&text).expect("parse fixture")
}

pub fn engine(store: &Arc<MemoryStore>) -> JourneyEngine {
    JourneyEngine::new(store.clone(), EngineConfig::default())
}

/// Builds a flow and its step bodies for seeding a store directly.
pub struct FlowBuilder {
    pub flow: FlowDoc,
    pub steps: Vec<StepDoc>,
}

impl FlowBuilder {
    pub fn new(id: &str, entry: &str) -> Self {
        FlowBuilder {
            flow: FlowDoc::new(id, entry),
            steps: Vec::new(),
        }
    }

    /// Add an outer step with its transitions and configuration.
    pub fn step(mut self, id: &str, node_type: &str, connections: &[(&str, &str)], config: Value) -> Self {
        let mut entry = NodeEntry::new(node_type);
        for (outcome, target) in connections {
            entry = entry.connect(*outcome, *target);
        }
        self.flow.nodes.insert(id.to_string(), entry);
        self.steps.push(step_doc(id, node_type, config));
        self
    }

    /// Add a step body that is not in the flow's map (an inner step).
    pub fn inner(mut self, id: &str, node_type: &str, config: Value) -> Self {
        self.steps.push(step_doc(id, node_type, config));
        self
    }

    pub async fn seed(self, store: &MemoryStore) {
        store
            .insert(
                ObjectKind::Flow,
                self.flow.id.clone(),
                serde_json::to_value(&self.flow).unwrap(),
            )
            .await;
        for step in self.steps {
            store
                .insert(ObjectKind::Node, step.id.clone(), step.to_value())
                .await;
        }
    }
}

pub fn step_doc(id: &str, node_type: &str, config: Value) -> StepDoc {
    let mut step = StepDoc::new(id, node_type);
    if let Value::Object(map) = config {
        step.config = map;
    }
    step
}

pub async fn seed_script(store: &MemoryStore, id: &str) {
    store
        .insert(
            ObjectKind::Script,
            id,
            json!({
                "_id": id,
                "name": format!("{id} name"),
                "language": "JAVASCRIPT",
                "context": "AUTHENTICATION_TREE_DECISION_NODE",
                "script": "var a = 1;\noutcome = \"true\";"
            }),
        )
        .await;
}

/// A flow touching every collaborator type, plus an unreachable step.
pub async fn seed_kitchen_sink(store: &MemoryStore) {
    FlowBuilder::new("KitchenSink", "page")
        .step(
            "page",
            "PageNode",
            &[("outcome", "decide")],
            json!({
                "nodes": [
                    {"_id": "user", "nodeType": "ValidatedUsernameNode", "displayName": "User"},
                    {"_id": "client", "nodeType": "ClientScriptNode", "displayName": "Device"}
                ],
                "stage": "{\"themeId\":\"dark\"}"
            }),
        )
        .inner("user", "ValidatedUsernameNode", json!({"usernameAttribute": "userName"}))
        .inner("client", "ClientScriptNode", json!({"script": "client-script"}))
        .step(
            "decide",
            "ScriptedDecisionNode",
            &[("true", "mail"), ("false", "social")],
            json!({"script": "decision-script", "outcomes": ["true", "false"]}),
        )
        .step(
            "mail",
            "EmailSuspendNode",
            &[("outcome", SUCCESS_NODE_ID)],
            json!({"emailTemplateName": "welcome"}),
        )
        .step(
            "social",
            "SocialProviderHandlerNode",
            &[("ACCOUNT_EXISTS", "saml")],
            json!({"script": "norm-script"}),
        )
        .step(
            "saml",
            "product-Saml2Node",
            &[("ACCOUNT_EXISTS", SUCCESS_NODE_ID)],
            json!({"idp": "urn:idp:one"}),
        )
        .step(
            "ghost",
            "ScriptedDecisionNode",
            &[("true", SUCCESS_NODE_ID)],
            json!({"script": "orphan-script"}),
        )
        .seed(store)
        .await;

    for id in [
        "decision-script",
        "client-script",
        "norm-script",
        "google-transform",
        "orphan-script",
    ] {
        seed_script(store, id).await;
    }
    store
        .insert(
            ObjectKind::EmailTemplate,
            "welcome",
            json!({"_id": "welcome", "subject": {"en": "Welcome"}}),
        )
        .await;
    store
        .insert(ObjectKind::Theme, "dark", json!({"_id": "dark", "name": "Dark"}))
        .await;
    store
        .insert(
            ObjectKind::SocialIdentityProvider,
            "google",
            json!({"_id": "google", "_type": {"_id": "googleConfig"}, "transform": "google-transform"}),
        )
        .await;
    store
        .insert(
            ObjectKind::SocialIdentityProvider,
            "apple",
            json!({"_id": "apple", "_type": {"_id": "appleConfig"}}),
        )
        .await;
    store
        .insert(
            ObjectKind::Saml2Entity,
            "aWRwMQ",
            json!({"_id": "aWRwMQ", "entityId": "urn:idp:one", "location": "remote"}),
        )
        .await;
    store
        .insert(
            ObjectKind::Saml2Metadata,
            "aWRwMQ",
            json!(["<EntityDescriptor entityID=\"urn:idp:one\"/>"]),
        )
        .await;
    store
        .insert(
            ObjectKind::CircleOfTrust,
            "cot1",
            json!({"_id": "cot1", "trustedProviders": ["urn:idp:one|saml2", "sp|saml2"]}),
        )
        .await;
    store
        .insert(
            ObjectKind::CircleOfTrust,
            "cot2",
            json!({"_id": "cot2", "trustedProviders": ["urn:idp:other|saml2"]}),
        )
        .await;
}

/// Outer page holding a page holding a client script step.
pub async fn seed_nested_pages(store: &MemoryStore) {
    FlowBuilder::new("Nested", "outer")
        .step(
            "outer",
            "PageNode",
            &[("outcome", SUCCESS_NODE_ID)],
            json!({"nodes": [{"_id": "mid", "nodeType": "PageNode"}]}),
        )
        .inner(
            "mid",
            "PageNode",
            json!({"nodes": [{"_id": "leaf", "nodeType": "ClientScriptNode"}]}),
        )
        .inner("leaf", "ClientScriptNode", json!({"script": "deep"}))
        .seed(store)
        .await;
    seed_script(store, "deep").await;
}
