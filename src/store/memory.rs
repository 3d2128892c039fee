use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use super::{ObjectKind, ObjectRef, ObjectStore};
use crate::error::{Operation, StoreError, StoreResult};

type Tables = BTreeMap<ObjectKind, BTreeMap<String, Value>>;

/// In-process object store keyed by kind and id.
///
/// Failures can be injected per object and operation, which lets callers
/// observe how the engine behaves when one remote call goes wrong.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failures: RwLock<HashSet<(ObjectKind, String, Operation)>>,
    calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without going through the collaborator surface.
    pub async fn insert(&self, kind: ObjectKind, id: impl Into<String>, body: Value) {
        self.tables
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(id.into(), body);
    }

    pub async fn get(&self, kind: ObjectKind, id: &str) -> Option<Value> {
        self.tables
            .read()
            .await
            .get(&kind)
            .and_then(|table| table.get(id))
            .cloned()
    }

    pub async fn ids(&self, kind: ObjectKind) -> Vec<String> {
        self.tables
            .read()
            .await
            .get(&kind)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, kind: ObjectKind) -> usize {
        self.tables
            .read()
            .await
            .get(&kind)
            .map(|table| table.len())
            .unwrap_or(0)
    }

    /// Make every `operation` on `(kind, id)` fail with a transport error.
    pub async fn fail_on(&self, kind: ObjectKind, id: impl Into<String>, operation: Operation) {
        self.failures
            .write()
            .await
            .insert((kind, id.into(), operation));
    }

    /// Number of collaborator calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Load a snapshot written by [`MemoryStore::save`]. A missing file yields an empty store.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let txt = fs::read_to_string(path)
            .with_context(|| format!("unable to read environment snapshot {}", path.display()))?;
        let tables: Tables = serde_json::from_str(&txt)
            .with_context(|| format!("invalid environment snapshot {}", path.display()))?;
        Ok(MemoryStore {
            tables: RwLock::new(tables),
            ..Self::default()
        })
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let tables = self.tables.read().await;
        let mut txt = serde_json::to_string_pretty(&*tables)?;
        txt.push('\n');
        fs::write(path, txt)
            .with_context(|| format!("unable to write environment snapshot {}", path.display()))
    }

    async fn check(&self, target: &ObjectRef, operation: Operation) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .read()
            .await
            .contains(&(target.kind, target.id.clone(), operation));
        if injected {
            return Err(StoreError::Transport(format!(
                "injected failure for {operation} {target}"
            )));
        }
        Ok(())
    }
}

/// Stamp the routing qualifier into bodies that carry it, so a later read can
/// hand it back.
fn with_subtype(target: &ObjectRef, body: &Value) -> Value {
    let mut body = body.clone();
    if let (Some(subtype), Value::Object(map)) = (&target.subtype, &mut body) {
        match target.kind {
            ObjectKind::Node | ObjectKind::SocialIdentityProvider => {
                map.entry("_type")
                    .or_insert_with(|| json!({ "_id": subtype }));
            }
            ObjectKind::Saml2Entity => {
                map.entry("location")
                    .or_insert_with(|| Value::String(subtype.clone()));
            }
            _ => {}
        }
    }
    body
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, target: &ObjectRef) -> StoreResult<Value> {
        self.check(target, Operation::Read).await?;
        self.get(target.kind, &target.id)
            .await
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self, kind: ObjectKind) -> StoreResult<Vec<Value>> {
        self.check(&ObjectRef::new(kind, "*"), Operation::List)
            .await?;
        Ok(self
            .tables
            .read()
            .await
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, target: &ObjectRef, body: &Value) -> StoreResult<Value> {
        self.check(target, Operation::Create).await?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(target.kind).or_default();
        if table.contains_key(&target.id) {
            return Err(StoreError::Conflict(format!("{target} already exists")));
        }
        let stored = with_subtype(target, body);
        table.insert(target.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, target: &ObjectRef, body: &Value) -> StoreResult<Value> {
        self.check(target, Operation::Update).await?;
        let mut tables = self.tables.write().await;
        let slot = tables
            .get_mut(&target.kind)
            .and_then(|table| table.get_mut(&target.id))
            .ok_or(StoreError::NotFound)?;
        *slot = with_subtype(target, body);
        Ok(slot.clone())
    }

    async fn delete(&self, target: &ObjectRef) -> StoreResult<()> {
        self.check(target, Operation::Delete).await?;
        self.tables
            .write()
            .await
            .get_mut(&target.kind)
            .and_then(|table| table.remove(&target.id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}
