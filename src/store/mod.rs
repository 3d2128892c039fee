//! Object collaborators: the narrow read/list/write/delete surface the engine
//! needs from the remote platform.
//!
//! The engine never talks to a transport directly. Every object it touches is
//! addressed with an [`ObjectRef`] and goes through an [`ObjectStore`].
//! [`MemoryStore`] is a complete in-process implementation used by the CLI
//! (backed by a JSON snapshot) and by the tests.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    Flow,
    Node,
    Script,
    EmailTemplate,
    Saml2Entity,
    Saml2Metadata,
    CircleOfTrust,
    SocialIdentityProvider,
    Theme,
}

impl ObjectKind {
    pub fn label(self) -> &'static str {
        match self {
            ObjectKind::Flow => "flow",
            ObjectKind::Node => "step",
            ObjectKind::Script => "script",
            ObjectKind::EmailTemplate => "email template",
            ObjectKind::Saml2Entity => "SAML entity",
            ObjectKind::Saml2Metadata => "SAML metadata",
            ObjectKind::CircleOfTrust => "circle of trust",
            ObjectKind::SocialIdentityProvider => "social identity provider",
            ObjectKind::Theme => "theme",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Address of one remote object.
///
/// `subtype` carries the routing qualifier some kinds need on the platform:
/// the node type for steps, the provider type for social identity providers,
/// and `hosted`/`remote` for SAML entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
    pub subtype: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        ObjectRef {
            kind,
            id: id.into(),
            subtype: None,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn flow(id: impl Into<String>) -> Self {
        ObjectRef::new(ObjectKind::Flow, id)
    }

    pub fn step(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        ObjectRef::new(ObjectKind::Node, id).with_subtype(node_type)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtype {
            Some(subtype) => write!(f, "{} '{}' ({subtype})", self.kind, self.id),
            None => write!(f, "{} '{}'", self.kind, self.id),
        }
    }
}

/// Remote object collaborator. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read one object body.
    async fn read(&self, target: &ObjectRef) -> StoreResult<Value>;

    /// List every object of a kind. Bodies may be summaries for some kinds,
    /// but always carry `_id`.
    async fn list(&self, kind: ObjectKind) -> StoreResult<Vec<Value>>;

    /// Create an object that does not exist yet.
    async fn create(&self, target: &ObjectRef, body: &Value) -> StoreResult<Value>;

    /// Replace an existing object. Returns `StoreError::NotFound` when absent.
    async fn update(&self, target: &ObjectRef, body: &Value) -> StoreResult<Value>;

    async fn delete(&self, target: &ObjectRef) -> StoreResult<()>;
}
