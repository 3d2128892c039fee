use std::fmt;

use thiserror::Error;

use crate::store::{ObjectKind, ObjectRef};

/// Structural failures. These abort an operation before any remote call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("JSON parse error in {source_label}: {message}")]
    Json {
        source_label: String,
        message: String,
    },
    #[error("Bundle is missing required top-level group '{group}'")]
    MissingGroup { group: &'static str },
    #[error("Flow '{flow_id}' has no entry step")]
    MissingEntry { flow_id: String },
    #[error("Flow '{flow_id}' entry step '{entry}' is not among its steps")]
    EntryNotFound { flow_id: String, entry: String },
    #[error("Flow '{flow_id}' references step '{step_id}' but the bundle has no body for it")]
    MissingStepBody { flow_id: String, step_id: String },
    #[error(
        "Container step '{container_id}' in flow '{flow_id}' references inner step '{inner_id}' but the bundle has no body for it"
    )]
    MissingInnerStepBody {
        flow_id: String,
        container_id: String,
        inner_id: String,
    },
    #[error("Flow '{flow_id}' could not be read: {source}")]
    FlowUnavailable {
        flow_id: String,
        #[source]
        source: StoreError,
    },
    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Failures reported by an object collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("cancelled before the request was issued")]
    Cancelled,
    /// One flow of a batch was structurally unusable.
    #[error("{0}")]
    Structural(Box<FlowError>),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    List,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Operation::Read => "read",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// A single collaborator call that failed, tagged with what was being touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} {target} failed: {source}")]
pub struct ObjectError {
    pub target: ObjectRef,
    pub operation: Operation,
    #[source]
    pub source: StoreError,
}

impl ObjectError {
    pub fn new(target: ObjectRef, operation: Operation, source: StoreError) -> Self {
        ObjectError {
            target,
            operation,
            source,
        }
    }

    pub fn listing(kind: ObjectKind, source: StoreError) -> Self {
        ObjectError::new(ObjectRef::new(kind, "*"), Operation::List, source)
    }

    /// Record a flow that a batch operation could not handle. A store failure
    /// reading the flow keeps its own source; anything else is structural.
    pub fn flow(flow_id: impl Into<String>, operation: Operation, err: FlowError) -> Self {
        let source = match err {
            FlowError::FlowUnavailable { source, .. } => source,
            other => StoreError::Structural(Box::new(other)),
        };
        ObjectError::new(ObjectRef::flow(flow_id), operation, source)
    }

    pub fn is_cancelled(&self) -> bool {
        self.source == StoreError::Cancelled
    }

    pub fn structural(&self) -> Option<&FlowError> {
        match &self.source {
            StoreError::Structural(err) => Some(err),
            _ => None,
        }
    }
}

/// Whether a partially successful operation reached every object it intended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Complete,
    Partial,
}

/// Result of an engine operation: whatever was produced, plus every per-object failure.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub errors: Vec<ObjectError>,
}

impl<T> Outcome<T> {
    pub fn new(value: T, errors: Vec<ObjectError>) -> Self {
        Outcome { value, errors }
    }

    pub fn complete(value: T) -> Self {
        Outcome {
            value,
            errors: Vec::new(),
        }
    }

    pub fn status(&self) -> OutcomeStatus {
        if self.errors.is_empty() {
            OutcomeStatus::Complete
        } else {
            OutcomeStatus::Partial
        }
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            errors: self.errors,
        }
    }

    /// Collapse into a `Result`, keeping the partial value inside the error.
    pub fn into_result(self) -> std::result::Result<T, PartialFailure<T>> {
        if self.errors.is_empty() {
            Ok(self.value)
        } else {
            Err(PartialFailure {
                partial: self.value,
                errors: self.errors,
            })
        }
    }
}

/// Aggregate error for operations that made progress but not on every object.
#[derive(Debug)]
pub struct PartialFailure<T> {
    pub partial: T,
    pub errors: Vec<ObjectError>,
}

impl<T> fmt::Display for PartialFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} object operation(s) failed", self.errors.len())?;
        match self.errors.first() {
            Some(first) if self.errors.len() == 1 => write!(f, ": {first}"),
            Some(first) => write!(f, ": {first} (and {} more)", self.errors.len() - 1),
            None => Ok(()),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PartialFailure<T> {}
