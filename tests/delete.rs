mod common;

use std::sync::Arc;

use common::{FlowBuilder, engine, frodo_bundle, seed_kitchen_sink, seed_script, step_doc};
use journey_bundle::{
    DeleteOptions, ImportOptions, MemoryStore, ObjectKind, SkipReason, error::Operation,
    model::SUCCESS_NODE_ID,
};
use pretty_assertions::assert_eq;
use serde_json::json;

const DEEP: DeleteOptions = DeleteOptions { deep: true };

/// Flows A and B share script "shared"; A alone uses "a-only" and template "a-mail".
async fn seed_pair(store: &MemoryStore) {
    FlowBuilder::new("A", "a1")
        .step(
            "a1",
            "ScriptedDecisionNode",
            &[("true", "a2")],
            json!({"script": "shared"}),
        )
        .step(
            "a2",
            "ScriptedDecisionNode",
            &[("true", "a3")],
            json!({"script": "a-only"}),
        )
        .step(
            "a3",
            "EmailSuspendNode",
            &[("outcome", SUCCESS_NODE_ID)],
            json!({"emailTemplateName": "a-mail"}),
        )
        .seed(store)
        .await;
    FlowBuilder::new("B", "b1")
        .step(
            "b1",
            "ScriptedDecisionNode",
            &[("true", SUCCESS_NODE_ID)],
            json!({"script": "shared"}),
        )
        .seed(store)
        .await;
    for id in ["shared", "a-only"] {
        seed_script(store, id).await;
    }
    store
        .insert(ObjectKind::EmailTemplate, "a-mail", json!({"_id": "a-mail"}))
        .await;
}

#[tokio::test]
async fn deep_delete_keeps_shared_dependencies() {
    let store = Arc::new(MemoryStore::new());
    seed_pair(&store).await;

    let outcome = engine(&store).delete_flow("A", &DEEP).await.unwrap();
    assert!(outcome.is_complete());
    let summary = outcome.value;
    assert!(summary.flow_deleted);
    assert_eq!(
        summary.was_skipped(ObjectKind::Script, "shared"),
        Some(&SkipReason::Shared {
            flows: vec!["B".to_string()]
        })
    );
    assert_eq!(summary.deleted_of(ObjectKind::Node).count(), 3);
    assert_eq!(summary.deleted_of(ObjectKind::Script).count(), 1);

    assert!(store.get(ObjectKind::Script, "shared").await.is_some());
    assert!(store.get(ObjectKind::Script, "a-only").await.is_none());
    assert!(store.get(ObjectKind::EmailTemplate, "a-mail").await.is_none());
    assert!(store.get(ObjectKind::Flow, "A").await.is_none());
    assert!(store.get(ObjectKind::Flow, "B").await.is_some());
    assert!(store.get(ObjectKind::Node, "b1").await.is_some());
}

#[tokio::test]
async fn shallow_delete_leaves_dependencies() {
    let store = Arc::new(MemoryStore::new());
    seed_pair(&store).await;
    let summary = engine(&store)
        .delete_flow("A", &DeleteOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(summary.skipped.is_empty());
    assert_eq!(store.count(ObjectKind::Script).await, 2);
    assert_eq!(store.count(ObjectKind::Node).await, 1);
}

#[tokio::test]
async fn failed_flow_delete_touches_nothing_else() {
    let store = Arc::new(MemoryStore::new());
    seed_pair(&store).await;
    store.fail_on(ObjectKind::Flow, "A", Operation::Delete).await;

    let outcome = engine(&store).delete_flow("A", &DEEP).await.unwrap();
    assert!(!outcome.value.flow_deleted);
    assert!(outcome.value.deleted.is_empty());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(store.count(ObjectKind::Node).await, 4);
    assert_eq!(store.count(ObjectKind::Script).await, 2);
}

#[tokio::test]
async fn one_failed_step_does_not_stop_the_rest() {
    let store = Arc::new(MemoryStore::new());
    seed_pair(&store).await;
    store.fail_on(ObjectKind::Node, "a2", Operation::Delete).await;

    let outcome = engine(&store).delete_flow("A", &DEEP).await.unwrap();
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].target.id, "a2");
    assert!(store.get(ObjectKind::Node, "a1").await.is_none());
    assert!(store.get(ObjectKind::Node, "a3").await.is_none());
    assert!(store.get(ObjectKind::Script, "a-only").await.is_none());
}

#[tokio::test]
async fn unreadable_sibling_blocks_collaborator_deletion() {
    let store = Arc::new(MemoryStore::new());
    seed_pair(&store).await;
    store.fail_on(ObjectKind::Node, "b1", Operation::Read).await;

    let summary = engine(&store).delete_flow("A", &DEEP).await.unwrap().value;
    assert!(summary.flow_deleted);
    assert_eq!(
        summary.was_skipped(ObjectKind::Script, "a-only"),
        Some(&SkipReason::CensusIncomplete)
    );
    assert!(store.get(ObjectKind::Script, "a-only").await.is_some());
    assert!(store.get(ObjectKind::Node, "a2").await.is_none());
}

#[tokio::test]
async fn social_handler_keeps_explicit_providers() {
    let store = Arc::new(MemoryStore::new());
    seed_kitchen_sink(&store).await;
    FlowBuilder::new("Picker", "pick")
        .step(
            "pick",
            "SelectIdPNode",
            &[("socialAuthentication", SUCCESS_NODE_ID)],
            json!({"filteredProviders": ["google"]}),
        )
        .seed(&store)
        .await;

    let summary = engine(&store)
        .delete_flow("Picker", &DEEP)
        .await
        .unwrap()
        .value;
    assert_eq!(
        summary.was_skipped(ObjectKind::SocialIdentityProvider, "google"),
        Some(&SkipReason::Shared {
            flows: vec!["KitchenSink".to_string()]
        })
    );
    assert!(store.get(ObjectKind::SocialIdentityProvider, "google").await.is_some());
}

#[tokio::test]
async fn deep_delete_of_kitchen_sink_removes_exclusive_objects() {
    let store = Arc::new(MemoryStore::new());
    seed_kitchen_sink(&store).await;

    let summary = engine(&store)
        .delete_flow("KitchenSink", &DEEP)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    // every step, reachable or not, plus the inner steps
    assert_eq!(summary.deleted_of(ObjectKind::Node).count(), 8);
    assert_eq!(store.count(ObjectKind::Node).await, 0);
    for script in ["decision-script", "client-script", "norm-script", "orphan-script"] {
        assert!(store.get(ObjectKind::Script, script).await.is_none(), "{script}");
    }
    assert!(store.get(ObjectKind::Theme, "dark").await.is_none());
    assert!(store.get(ObjectKind::Saml2Entity, "aWRwMQ").await.is_none());
    // every provider is consulted by the handler step, none is deleted for it
    assert_eq!(store.count(ObjectKind::SocialIdentityProvider).await, 2);
}

#[tokio::test]
async fn delete_all_flows_removes_shared_objects_last() {
    let store = Arc::new(MemoryStore::new());
    seed_pair(&store).await;
    let outcome = engine(&store).delete_flows(&DEEP).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.value.len(), 2);
    assert_eq!(store.count(ObjectKind::Flow).await, 0);
    assert_eq!(store.count(ObjectKind::Script).await, 0);
}

#[tokio::test]
async fn orphaned_steps_are_found_and_removed() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);
    engine
        .import_flow(&frodo_bundle(), &ImportOptions::default())
        .await
        .unwrap();
    let stray_page = step_doc(
        "stray-page",
        "PageNode",
        json!({"nodes": [{"_id": "stray-inner", "nodeType": "ValidatedUsernameNode"}]}),
    );
    let stray_inner = step_doc("stray-inner", "ValidatedUsernameNode", json!({}));
    for step in [stray_page, stray_inner] {
        store
            .insert(ObjectKind::Node, step.id.clone(), step.to_value())
            .await;
    }

    let found = engine.find_orphaned_steps().await.into_result().unwrap();
    let mut ids: Vec<&str> = found.iter().map(|t| t.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["stray-inner", "stray-page"]);

    let removed = engine.remove_orphaned_steps().await.into_result().unwrap();
    assert_eq!(removed.len(), 2);
    assert_eq!(store.count(ObjectKind::Node).await, 12);
    assert!(engine.find_orphaned_steps().await.value.is_empty());
}

#[tokio::test]
async fn enabling_and_disabling_a_flow() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);
    engine
        .import_flow(&frodo_bundle(), &ImportOptions::default())
        .await
        .unwrap();
    let flow = engine
        .set_flow_enabled("FrodoTest", false)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(!flow.enabled());
    let stored = store.get(ObjectKind::Flow, "FrodoTest").await.unwrap();
    assert_eq!(stored["enabled"], json!(false));
}
