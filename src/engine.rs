use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::EngineConfig,
    error::{FlowError, ObjectError, Operation, Outcome, Result, StoreError},
    fanout::FanOut,
    model::{FlowDoc, strip_revision},
    store::{ObjectKind, ObjectRef, ObjectStore},
    walker::{DiscoverOptions, DiscoverScope, Discovery, StepSource, discover},
};

/// Entry point for export, import and delete against one object store.
///
/// Operations run one logical flow of control each; only independent
/// per-object requests inside a phase are issued concurrently.
#[derive(Clone)]
pub struct JourneyEngine {
    store: Arc<dyn ObjectStore>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl JourneyEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: EngineConfig) -> Self {
        JourneyEngine {
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token, e.g. one tied to Ctrl-C.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn fan(&self) -> FanOut {
        FanOut::new(self.config.concurrency, self.cancel.clone())
    }

    /// Read and decode a flow record. Failure here leaves nothing to work on.
    pub async fn read_flow(&self, flow_id: &str) -> Result<FlowDoc> {
        let body = self
            .store
            .read(&ObjectRef::flow(flow_id))
            .await
            .map_err(|source| FlowError::FlowUnavailable {
                flow_id: flow_id.to_string(),
                source,
            })?;
        decode_flow(body).map_err(|source| FlowError::FlowUnavailable {
            flow_id: flow_id.to_string(),
            source,
        })
    }

    /// Every flow in scope. Undecodable records are reported, not fatal.
    pub async fn list_flows(&self) -> Outcome<Vec<FlowDoc>> {
        let bodies = match self.store.list(ObjectKind::Flow).await {
            Ok(bodies) => bodies,
            Err(source) => {
                return Outcome::new(Vec::new(), vec![ObjectError::listing(ObjectKind::Flow, source)]);
            }
        };
        let mut flows = Vec::with_capacity(bodies.len());
        let mut errors = Vec::new();
        for body in bodies {
            let id = body
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            match decode_flow(body) {
                Ok(flow) => flows.push(flow),
                Err(source) => {
                    warn!(flow = %id, error = %source, "skipping undecodable flow");
                    errors.push(ObjectError::new(ObjectRef::flow(id), Operation::Read, source));
                }
            }
        }
        Outcome::new(flows, errors)
    }

    /// Discover a flow against the live store.
    pub async fn discover_flow(
        &self,
        flow: &FlowDoc,
        source: &dyn StepSource,
        scope: DiscoverScope,
    ) -> Result<Outcome<Discovery>> {
        discover(flow, source, &DiscoverOptions { scope }, &self.fan()).await
    }

    /// Switch a flow on or off. On failure the unchanged record is returned
    /// together with the error.
    pub async fn set_flow_enabled(&self, flow_id: &str, enabled: bool) -> Result<Outcome<FlowDoc>> {
        let mut flow = self.read_flow(flow_id).await?;
        if flow.enabled() == enabled {
            return Ok(Outcome::complete(flow));
        }
        let original = flow.clone();
        flow.extra.insert("enabled".to_string(), Value::Bool(enabled));
        let mut body = serde_json::to_value(&flow).map_err(|e| FlowError::Internal {
            message: format!("flow serialization: {e}"),
        })?;
        strip_revision(&mut body);
        let target = ObjectRef::flow(flow_id);
        match self.store.update(&target, &body).await {
            Ok(_) => {
                info!(flow = %flow_id, enabled, "flow state changed");
                Ok(Outcome::complete(flow))
            }
            Err(source) => Ok(Outcome::new(
                original,
                vec![ObjectError::new(target, Operation::Update, source)],
            )),
        }
    }
}

pub(crate) fn decode_flow(body: Value) -> std::result::Result<FlowDoc, StoreError> {
    serde_json::from_value(body).map_err(|e| StoreError::Rejected(format!("invalid flow body: {e}")))
}
