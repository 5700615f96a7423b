//! Persisted function chains ("runs") and their status transitions.
//!
//! A run lives at `<work-ref>/<n>`, where the work ref is a release's
//! `deploy/<env>` or `task/<name>` document and `n` counts attempts from 1. The
//! work ref carries a status marker mirroring its newest run.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::is_not_found;
use crate::package::{FunctionDef, Inputs};
use crate::refs::Ref;
use crate::status::Status;
use crate::store::RefAccess;

/// Where a function input comes from: a literal, a ref to read, or a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Relative refs resolve against the run's package
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Ref>,
}

impl InputDescriptor {
    pub fn literal(value: Value) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn from_ref(reference: Ref) -> Self {
        Self {
            reference: Some(reference),
            ..Self::default()
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Up,
    Down,
    Call,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Call => "call",
        })
    }
}

/// One step of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    #[serde(rename = "fn")]
    pub function: FunctionDef,
    #[serde(default)]
    pub inputs: Inputs,
    /// Work refs that must be complete before this step may run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Ref>,
    /// Inputs as they resolved when the step executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_inputs: Option<BTreeMap<String, Value>>,
}

impl Function {
    pub fn new(function: FunctionDef, inputs: Inputs) -> Self {
        Self {
            function,
            inputs,
            dependencies: Vec::new(),
            resolved_inputs: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Ref>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Same step, not yet executed.
    pub fn fresh_copy(&self) -> Self {
        Self {
            resolved_inputs: None,
            ..self.clone()
        }
    }
}

/// Append-only chain of functions for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub release: Ref,
    pub functions: Vec<Function>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    pub fn new(run_type: RunType, release: Ref, first: Function) -> Self {
        Self {
            run_type,
            release,
            functions: vec![first],
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    /// First function of the chain; its inputs identify a deployment.
    pub fn entry(&self) -> Option<&Function> {
        self.functions.first()
    }

    /// Function to execute next.
    pub fn current(&self) -> Option<&Function> {
        self.functions.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Function> {
        self.functions.last_mut()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(BTreeMap<String, Value>),
    /// Names of inputs whose refs do not exist yet and have no default
    Unresolved(Vec<String>),
}

/// Resolve one input against `base`. `None` means it cannot be resolved yet.
pub fn resolve_input(
    access: &impl RefAccess,
    base: &Ref,
    input: &InputDescriptor,
) -> anyhow::Result<Option<Value>> {
    if let Some(value) = &input.value {
        return Ok(Some(value.clone()));
    }
    let Some(reference) = &input.reference else {
        return Ok(input.default.clone());
    };
    let target = reference.relative_to(base);
    match access.get(&target) {
        Ok(value) => Ok(Some(value)),
        Err(err) if is_not_found(&err) => Ok(input.default.clone()),
        Err(err) => Err(err).with_context(|| format!("Failed to resolve input ref {}", target)),
    }
}

pub fn resolve_inputs(
    access: &impl RefAccess,
    base: &Ref,
    inputs: &Inputs,
) -> anyhow::Result<Resolution> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();
    for (name, input) in inputs {
        match resolve_input(access, base, input)? {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => missing.push(name.clone()),
        }
    }
    if missing.is_empty() {
        Ok(Resolution::Resolved(resolved))
    } else {
        Ok(Resolution::Unresolved(missing))
    }
}

/// Every dependency of `function` has completed.
pub fn dependencies_satisfied(access: &impl RefAccess, function: &Function) -> anyhow::Result<bool> {
    for dependency in &function.dependencies {
        if access.status(dependency)? != Some(Status::Complete) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Resolved inputs of the current function when the run can execute now.
pub fn ready_inputs(
    access: &impl RefAccess,
    run_ref: &Ref,
    run: &Run,
) -> anyhow::Result<Option<BTreeMap<String, Value>>> {
    let Some(current) = run.current() else {
        return Ok(None);
    };
    if !dependencies_satisfied(access, current)? {
        return Ok(None);
    }
    match resolve_inputs(access, run_ref, &current.inputs)? {
        Resolution::Resolved(values) => Ok(Some(values)),
        Resolution::Unresolved(_) => Ok(None),
    }
}

pub fn load_run(access: &impl RefAccess, run_ref: &Ref) -> anyhow::Result<Run> {
    access
        .get_as(run_ref)
        .with_context(|| format!("Failed to load run {}", run_ref))
}

pub fn save_run(access: &impl RefAccess, run_ref: &Ref, run: &Run) -> anyhow::Result<()> {
    access.set(run_ref, "run", run)
}

/// Run numbers already used under `work_ref`.
pub fn run_numbers(access: &impl RefAccess, work_ref: &Ref) -> anyhow::Result<Vec<u64>> {
    let mut numbers: Vec<u64> = access
        .match_refs(&format!("{}/*", work_ref.path()))?
        .iter()
        .filter_map(|child| child.name().and_then(|name| name.parse().ok()))
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

/// `<work_ref>/<highest existing + 1>`.
pub fn next_run_ref(access: &impl RefAccess, work_ref: &Ref) -> anyhow::Result<Ref> {
    let next = run_numbers(access, work_ref)?.last().copied().unwrap_or(0) + 1;
    Ok(work_ref.join_sub_path(&next.to_string()))
}

/// Newest run under `work_ref`, if any.
pub fn latest_run_ref(access: &impl RefAccess, work_ref: &Ref) -> anyhow::Result<Option<Ref>> {
    Ok(run_numbers(access, work_ref)?
        .last()
        .map(|n| work_ref.join_sub_path(&n.to_string())))
}

/// Move `run_ref` to `status`, mirroring it onto the work ref.
pub fn transition(access: &impl RefAccess, run_ref: &Ref, status: Status) -> anyhow::Result<()> {
    if let Some(current) = access.status(run_ref)?
        && current != status
        && !current.can_transition_to(status)
    {
        anyhow::bail!(
            "Invalid status transition for {}: {} -> {}",
            run_ref,
            current,
            status
        );
    }
    access.set_status(run_ref, status)?;
    if status != Status::FailedRetried
        && let Some(work_ref) = run_ref.parent()
    {
        access.set_status(&work_ref, status)?;
    }
    Ok(())
}

/// Persist `run` as the next attempt under `work_ref`, pending, with its
/// dependency index entries.
pub fn create_run(access: &impl RefAccess, work_ref: &Ref, run: &Run) -> anyhow::Result<Ref> {
    let run_ref = next_run_ref(access, work_ref)?;
    save_run(access, &run_ref, run)?;
    if let Some(entry) = run.entry() {
        for dependency in &entry.dependencies {
            access.add_dependency(&run_ref, dependency)?;
        }
    }
    transition(access, &run_ref, Status::Pending)?;
    Ok(run_ref)
}
