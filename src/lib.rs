//! Journey export, import and deletion with dependency resolution.
//!
//! A journey is a graph of steps joined by outcome transitions. Exporting one
//! walks that graph from its entry step, classifies every step by type to find
//! the shared objects it references (scripts, email templates, SAML entities,
//! social identity providers, themes) and packages everything into a single
//! [`FlowBundle`]. Importing writes a bundle back, dependencies first, and can
//! regenerate step ids so a journey can be cloned next to its original.
//! Deleting removes a journey and, in deep mode, the objects no other journey
//! still references.
//!
//! All remote access goes through [`store::ObjectStore`].
#![forbid(unsafe_code)]

pub mod bundle;
pub mod config;
pub mod delete;
pub mod engine;
pub mod error;
pub mod export;
pub mod fanout;
pub mod import;
pub mod model;
pub mod rewrite;
pub mod step_kind;
pub mod store;
pub mod walker;

pub use bundle::{FlowBundle, MultiFlowExport, ScriptEncoding, parse_bundle, parse_document};
pub use config::EngineConfig;
pub use delete::{DeleteOptions, DeletionSummary, SkipReason};
pub use engine::JourneyEngine;
pub use error::{FlowError, ObjectError, Outcome, OutcomeStatus, PartialFailure, StoreError};
pub use export::ExportOptions;
pub use import::{ImportOptions, ImportSummary};
pub use model::{FlowDoc, NodeEntry, StepDoc};
pub use rewrite::{RemapTable, rewrite};
pub use store::{MemoryStore, ObjectKind, ObjectRef, ObjectStore};
