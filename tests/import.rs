mod common;

use std::sync::Arc;

use common::{FlowBuilder, engine, frodo_bundle, seed_kitchen_sink, seed_nested_pages};
use journey_bundle::{
    ExportOptions, FlowBundle, FlowError, ImportOptions, MemoryStore, ObjectKind, error::Operation,
    model::{FAILURE_NODE_ID, SUCCESS_NODE_ID},
    parse_document,
};
use pretty_assertions::assert_eq;
use serde_json::json;

async fn export_kitchen_sink() -> FlowBundle {
    let source = Arc::new(MemoryStore::new());
    seed_kitchen_sink(&source).await;
    engine(&source)
        .export_flow("KitchenSink", &ExportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap()
}

#[tokio::test]
async fn round_trip_preserves_the_bundle() {
    let exported = export_kitchen_sink().await;

    let target = Arc::new(MemoryStore::new());
    let imported = engine(&target)
        .import_flow(&exported, &ImportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(imported.flow_written());
    assert_eq!(imported.written(ObjectKind::Script), 4);
    assert_eq!(imported.written(ObjectKind::Node), 7);
    assert_eq!(imported.written(ObjectKind::CircleOfTrust), 1);

    let again = engine(&target)
        .export_flow("KitchenSink", &ExportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(again.digest(), exported.digest());
}

#[tokio::test]
async fn re_uuid_round_trip_is_isomorphic() {
    let exported = export_kitchen_sink().await;
    let target = Arc::new(MemoryStore::new());
    let options = ImportOptions {
        deps: true,
        re_uuid: true,
    };
    let summary = engine(&target)
        .import_flow(&exported, &options)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let remap = summary.remap.expect("ids were regenerated");
    assert_eq!(remap.len(), 7);

    let again = engine(&target)
        .export_flow("KitchenSink", &ExportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(again.nodes.len(), exported.nodes.len());
    assert_eq!(again.inner_nodes.len(), exported.inner_nodes.len());
    assert_eq!(
        again.tree.entry_node_id.as_deref(),
        Some(remap.resolve(exported.tree.entry_node_id.as_deref().unwrap()))
    );
    for (old_id, entry) in &exported.tree.nodes {
        let new_id = remap.get(old_id).expect("every step remapped");
        assert_ne!(new_id, old_id.as_str());
        let moved = &again.tree.nodes[new_id];
        assert_eq!(moved.node_type, entry.node_type);
        for (outcome, target) in &entry.connections {
            assert_eq!(moved.connections[outcome], remap.resolve(target));
        }
        assert_eq!(again.nodes[new_id].id, new_id);
    }
    for old_id in exported.inner_nodes.keys() {
        assert!(again.inner_nodes.contains_key(remap.resolve(old_id)));
    }
    // shared objects keep their ids
    assert_eq!(again.scripts, exported.scripts);
    assert_eq!(again.themes, exported.themes);
}

#[tokio::test]
async fn re_uuid_rewrites_nested_page_references() {
    let source = Arc::new(MemoryStore::new());
    seed_nested_pages(&source).await;
    let exported = engine(&source)
        .export_flow("Nested", &ExportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let target = Arc::new(MemoryStore::new());
    let options = ImportOptions {
        deps: true,
        re_uuid: true,
    };
    let summary = engine(&target)
        .import_flow(&exported, &options)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let remap = summary.remap.expect("ids were regenerated");
    let (outer, mid, leaf) = (
        remap.resolve("outer"),
        remap.resolve("mid"),
        remap.resolve("leaf"),
    );
    assert!(target.get(ObjectKind::Node, "mid").await.is_none());

    let again = engine(&target)
        .export_flow("Nested", &ExportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(again.nodes[outer].config["nodes"][0]["_id"], json!(mid));
    assert_eq!(again.inner_nodes[mid].config["nodes"][0]["_id"], json!(leaf));
    assert_eq!(again.inner_nodes[leaf].config["script"], json!("deep"));
    assert_eq!(again.scripts, exported.scripts);
}

#[test]
fn terminal_markers_survive_rewriting() {
    let bundle = frodo_bundle();
    let (rewritten, remap) = journey_bundle::rewrite(&bundle);
    assert!(remap.get(SUCCESS_NODE_ID).is_none());
    assert!(remap.get(FAILURE_NODE_ID).is_none());
    let targets: Vec<&str> = rewritten
        .tree
        .nodes
        .values()
        .flat_map(|entry| entry.connections.values().map(String::as_str))
        .collect();
    assert!(targets.contains(&SUCCESS_NODE_ID));
    assert!(targets.contains(&FAILURE_NODE_ID));
    // the source bundle is not touched
    assert!(bundle.nodes.contains_key("e2c39477-847a-4df2-9c5d-b449a752638b"));
}

#[tokio::test]
async fn second_import_updates_instead_of_creating() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(&store);
    let first = engine
        .import_flow(&frodo_bundle(), &ImportOptions::default())
        .await
        .unwrap()
        .value;
    assert_eq!(first.created.get(&ObjectKind::Node), Some(&12));
    assert!(first.updated.is_empty());

    let second = engine
        .import_flow(&frodo_bundle(), &ImportOptions::default())
        .await
        .unwrap()
        .value;
    assert!(second.created.is_empty());
    assert_eq!(second.updated.get(&ObjectKind::Node), Some(&12));
    assert_eq!(second.updated.get(&ObjectKind::Flow), Some(&1));
}

#[tokio::test]
async fn flow_failure_after_steps_is_reported_distinctly() {
    let store = Arc::new(MemoryStore::new());
    store
        .fail_on(ObjectKind::Flow, "FrodoTest", Operation::Update)
        .await;
    let outcome = engine(&store)
        .import_flow(&frodo_bundle(), &ImportOptions::default())
        .await
        .unwrap();

    let incomplete = outcome
        .value
        .incomplete_flow
        .clone()
        .expect("flow record failed");
    assert_eq!(incomplete.steps_written, 12);
    assert_eq!(incomplete.error.target.kind, ObjectKind::Flow);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(store.count(ObjectKind::Node).await, 12);
    assert!(store.get(ObjectKind::Flow, "FrodoTest").await.is_none());
}

#[tokio::test]
async fn failed_dependency_does_not_stop_later_phases() {
    let exported = export_kitchen_sink().await;
    let store = Arc::new(MemoryStore::new());
    store
        .fail_on(ObjectKind::Script, "decision-script", Operation::Create)
        .await;
    let outcome = engine(&store)
        .import_flow(&exported, &ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].operation, Operation::Create);
    assert_eq!(store.count(ObjectKind::Script).await, 3);
    assert!(outcome.value.flow_written());
    assert!(outcome.value.incomplete_flow.is_none());
}

#[tokio::test]
async fn structural_errors_make_no_remote_calls() {
    let mut bundle = frodo_bundle();
    bundle
        .inner_nodes
        .shift_remove("7354982f-57b6-4b04-9ddc-f1dd1e1e07d0");
    let store = Arc::new(MemoryStore::new());
    let err = engine(&store)
        .import_flow(&bundle, &ImportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::MissingInnerStepBody { .. }));
    assert_eq!(store.calls(), 0);
}

#[tokio::test]
async fn shallow_import_skips_dependencies() {
    let exported = export_kitchen_sink().await;
    let store = Arc::new(MemoryStore::new());
    let options = ImportOptions {
        deps: false,
        re_uuid: false,
    };
    let summary = engine(&store)
        .import_flow(&exported, &options)
        .await
        .unwrap()
        .value;
    assert_eq!(summary.written(ObjectKind::Script), 0);
    assert_eq!(store.count(ObjectKind::Script).await, 0);
    assert_eq!(store.count(ObjectKind::Node).await, 7);
}

#[tokio::test]
async fn sub_journeys_are_imported_first() {
    let source = Arc::new(MemoryStore::new());
    FlowBuilder::new("Outer", "eval")
        .step(
            "eval",
            "InnerTreeEvaluatorNode",
            &[("true", SUCCESS_NODE_ID), ("false", FAILURE_NODE_ID)],
            json!({"tree": "Inner"}),
        )
        .seed(&source)
        .await;
    FlowBuilder::new("Inner", "msg")
        .step("msg", "MessageNode", &[("true", SUCCESS_NODE_ID)], json!({}))
        .seed(&source)
        .await;
    let exported = engine(&source)
        .export_flows(&ExportOptions::default())
        .await
        .into_result()
        .unwrap();
    // put the referrer first in the document
    let text = serde_json::to_string(&exported).unwrap();
    let mut bundles = parse_document(&text, "multi").unwrap();
    bundles.reverse();
    assert_eq!(bundles[0].flow_id(), "Outer");

    let target = Arc::new(MemoryStore::new());
    let summaries = engine(&target)
        .import_flows(&bundles, &ImportOptions::default())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let order: Vec<&str> = summaries.iter().map(|s| s.flow_id.as_str()).collect();
    assert_eq!(order, vec!["Inner", "Outer"]);
}

#[tokio::test]
async fn dangling_transitions_import_with_a_warning() {
    let mut bundle = frodo_bundle();
    bundle
        .tree
        .nodes
        .get_mut("2998c1c9-f4c8-4a00-b2c6-3426783ee49d")
        .unwrap()
        .connections
        .insert("other".into(), "does-not-exist".into());
    let store = Arc::new(MemoryStore::new());
    let outcome = engine(&store)
        .import_flow(&bundle, &ImportOptions::default())
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.value.dangling.len(), 1);
    assert_eq!(outcome.value.dangling[0].target, "does-not-exist");
}
