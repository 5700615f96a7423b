//! Pipeline definitions and the function execution contract.
//!
//! A [`Package`] is produced by whatever evaluates the pipeline source; the engine
//! only stores it and hands [`FunctionDef`]s back to a [`FunctionRunner`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Span;

use crate::refs::Ref;
use crate::run::{InputDescriptor, RunType};

/// Declared inputs of a function, by name.
pub type Inputs = BTreeMap<String, InputDescriptor>;

/// Opaque handle to a function inside the package source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDef {
    pub id: String,
    /// Source position, for messages only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub position: String,
}

impl FunctionDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub name: String,
    pub work: Vec<Work>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Work {
    Deployment(Deployment),
    Call(WorkCall),
}

/// Deploys `up` to an environment; `down` tears it down when the deploy intent
/// is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub environment: String,
    pub up: FunctionDef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<FunctionDef>,
    #[serde(default)]
    pub inputs: Inputs,
}

/// A one-off task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkCall {
    pub name: String,
    #[serde(rename = "fn")]
    pub function: FunctionDef,
    #[serde(default)]
    pub inputs: Inputs,
}

/// What a function asks the engine to do next. At most one field may be set;
/// none set means the run completed without outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<Done>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl WorkResult {
    pub fn next(function: FunctionDef, inputs: Inputs) -> Self {
        Self {
            next: Some(NextFunction { function, inputs }),
            ..Self::default()
        }
    }

    pub fn done(done: Done) -> Self {
        Self {
            done: Some(done),
            ..Self::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            err: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn outcome(self) -> Outcome {
        match (self.next, self.done, self.err) {
            (Some(next), None, None) => Outcome::Next(next),
            (None, Some(done), None) => Outcome::Done(done),
            (None, None, Some(err)) => Outcome::Failed(err),
            (None, None, None) => Outcome::Done(Done::default()),
            _ => Outcome::Failed("function returned more than one of next, done and err".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextFunction {
    #[serde(rename = "fn")]
    pub function: FunctionDef,
    #[serde(default)]
    pub inputs: Inputs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Done {
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Release tags to point at this release (`@<tag>`)
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Next(NextFunction),
    Done(Done),
    Failed(String),
}

/// Everything a function sees when it runs.
#[derive(Debug, Clone)]
pub struct FunctionContext {
    pub run: Ref,
    pub release: Ref,
    pub run_type: RunType,
    pub inputs: BTreeMap<String, Value>,
    /// Checkout pinned to the release commit, when running in a worktree
    pub work_dir: Option<PathBuf>,
    /// Span to log under
    pub span: Span,
}

/// Executes function definitions. Errors are recorded as failed runs.
pub trait FunctionRunner: Send + Sync {
    fn run(&self, function: &FunctionDef, context: &FunctionContext) -> anyhow::Result<WorkResult>;
}

impl<F> FunctionRunner for F
where
    F: Fn(&FunctionDef, &FunctionContext) -> anyhow::Result<WorkResult> + Send + Sync,
{
    fn run(&self, function: &FunctionDef, context: &FunctionContext) -> anyhow::Result<WorkResult> {
        self(function, context)
    }
}
