//! Reconciling declared Intent with converged State.
//!
//! Both trees use the same refs under `<package>/+/`: `environment/<env>`,
//! `custom/<path>` and `deploy/<env>`. Intent deploy documents name a release and
//! input overrides; State deploy documents name the release and the run that
//! realised it.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{is_not_found, not_found};
use crate::package::{Deployment, Inputs};
use crate::refs::{Ref, SubPathType};
use crate::release::resolve_release;
use crate::run::{Function, Run, RunType, create_run, load_run, run_numbers};
use crate::store::{RefAccess, RefStore};

/// Intent document at `+/deploy/<env>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployIntent {
    /// Release (or tag, or `@`) to deploy
    pub release: Ref,
    /// Overrides layered over the deployment's declared inputs
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
}

/// State document at `+/deploy/<env>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub release: Ref,
    pub run: Ref,
}

/// `base` with every entry of `layer` applied on top.
pub fn overlay(base: &Inputs, layer: &Inputs) -> Inputs {
    let mut out = base.clone();
    out.extend(layer.iter().map(|(name, input)| (name.clone(), input.clone())));
    out
}

/// Entries of `actual` that differ from `base`; the inverse of [`overlay`].
pub fn overrides(base: &Inputs, actual: &Inputs) -> Inputs {
    actual
        .iter()
        .filter(|(name, input)| base.get(*name) != Some(*input))
        .map(|(name, input)| (name.clone(), input.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub reference: Ref,
    pub change: ChangeKind,
}

/// What [`apply_intent`] did for one ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "run", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Unchanged,
    Written,
    Deleted,
    RunQueued(Ref),
    /// An outstanding run already deploys the same release with the same inputs
    AlreadyQueued(Ref),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub applied: Vec<(Ref, ApplyOutcome)>,
    pub failed: Vec<(Ref, String)>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Glob of the reconciled refs of every package matching `scope`.
pub fn intent_pattern(scope: &str) -> String {
    format!("{}/+*/{{deploy,custom,environment}}/**", scope)
}

/// Changes needed to make State match Intent within `scope` (a package glob such
/// as `**` or `github.com/acme/app/-/deploy.star`).
///
/// Ordered: environment upserts, custom values, deployments, environment deletes.
pub fn diff(intent: &RefStore, state: &RefStore, scope: &str) -> anyhow::Result<Vec<DiffEntry>> {
    let pattern = intent_pattern(scope);
    let declared: BTreeSet<Ref> = intent.match_refs(&pattern)?.into_iter().collect();
    let converged: BTreeSet<Ref> = state.match_refs(&pattern)?.into_iter().collect();

    let mut entries = Vec::new();
    for reference in declared.union(&converged) {
        let change = match (declared.contains(reference), converged.contains(reference)) {
            (true, false) => ChangeKind::Create,
            (false, true) => ChangeKind::Delete,
            _ => {
                if converged_matches(intent, state, reference)? {
                    continue;
                }
                ChangeKind::Update
            }
        };
        entries.push(DiffEntry {
            reference: reference.clone(),
            change,
        });
    }
    entries.sort_by_key(|entry| (apply_order(entry), entry.reference.clone()));
    debug!(scope, changes = entries.len(), "diff");
    Ok(entries)
}

fn apply_order(entry: &DiffEntry) -> u8 {
    match (entry.reference.sub_path_type, entry.change) {
        (SubPathType::Environment, ChangeKind::Delete) => 3,
        (SubPathType::Environment, _) => 0,
        (SubPathType::Custom, _) => 1,
        _ => 2,
    }
}

/// Whether State already reflects the Intent document at `reference`.
fn converged_matches(intent: &RefStore, state: &RefStore, reference: &Ref) -> anyhow::Result<bool> {
    if reference.sub_path_type != SubPathType::Deploy {
        let (_, declared) = intent.get_object(reference)?;
        let (_, converged) = state.get_object(reference)?;
        return Ok(declared.body == converged.body && declared.body_type == converged.body_type);
    }

    let declared: DeployIntent = intent.get_as(reference)?;
    let record: DeployRecord = state.get_as(reference)?;
    let release = match resolve_release(state, &declared.release.relative_to(reference)) {
        Ok(release) => release,
        Err(err) if is_not_found(&err) => return Ok(false),
        Err(err) => return Err(err),
    };
    if release != record.release {
        return Ok(false);
    }
    let Some(expected) = expected_inputs(state, &release, reference, &declared)? else {
        return Ok(false);
    };
    let run = match load_run(state, &record.run) {
        Ok(run) => run,
        Err(err) if is_not_found(&err) => return Ok(false),
        Err(err) => return Err(err),
    };
    Ok(run.entry().map(|entry| &entry.inputs) == Some(&expected))
}

/// Work ref of the deployment `reference` (`+/deploy/<env>`) at `release`.
fn deployment_ref(release: &Ref, reference: &Ref) -> Ref {
    release
        .release_ref()
        .with_sub_path(SubPathType::Deploy, reference.sub_path.clone())
}

/// Deployment inputs overlaid with the intent's overrides, or `None` when the
/// release has no such deployment.
fn expected_inputs(
    state: &RefStore,
    release: &Ref,
    reference: &Ref,
    declared: &DeployIntent,
) -> anyhow::Result<Option<Inputs>> {
    match state.get_as::<Deployment>(&deployment_ref(release, reference)) {
        Ok(deployment) => Ok(Some(overlay(&deployment.inputs, &declared.inputs))),
        Err(err) if is_not_found(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Make State match Intent for the single ref `reference`.
pub fn apply_intent(intent: &RefStore, state: &RefStore, reference: &Ref) -> anyhow::Result<ApplyOutcome> {
    if !reference.is_intent() {
        anyhow::bail!("{} is not an intent ref", reference);
    }
    match reference.sub_path_type {
        SubPathType::Environment => apply_environment(intent, state, reference),
        SubPathType::Custom => copy_verbatim(intent, state, reference),
        SubPathType::Deploy => apply_deploy(intent, state, reference),
        other => anyhow::bail!("Cannot apply intent for '{}' refs: {}", other, reference),
    }
}

/// Copy the Intent document (or its absence) into State unchanged.
fn copy_verbatim(intent: &RefStore, state: &RefStore, reference: &Ref) -> anyhow::Result<ApplyOutcome> {
    let declared = match intent.get_object(reference) {
        Ok((_, object)) => Some(object),
        Err(err) if is_not_found(&err) => None,
        Err(err) => return Err(err),
    };
    let converged = match state.get_object(reference) {
        Ok((_, object)) => Some(object),
        Err(err) if is_not_found(&err) => None,
        Err(err) => return Err(err),
    };
    match (declared, converged) {
        (Some(declared), Some(converged))
            if declared.body == converged.body && declared.body_type == converged.body_type =>
        {
            Ok(ApplyOutcome::Unchanged)
        }
        (Some(declared), _) => {
            let body_type = declared.body_type.as_deref().unwrap_or("custom");
            state.set(reference, body_type, &declared.body)?;
            Ok(ApplyOutcome::Written)
        }
        (None, Some(_)) => {
            state.delete(reference)?;
            Ok(ApplyOutcome::Deleted)
        }
        (None, None) => Ok(ApplyOutcome::Unchanged),
    }
}

fn apply_environment(intent: &RefStore, state: &RefStore, reference: &Ref) -> anyhow::Result<ApplyOutcome> {
    let outcome = copy_verbatim(intent, state, reference)?;
    if outcome == ApplyOutcome::Unchanged {
        return Ok(outcome);
    }
    let Some(environment) = reference.name() else {
        return Ok(outcome);
    };
    let deploying = state.match_refs(&format!(
        "{}/@?*/deploy/{}",
        reference.package_prefix(),
        environment
    ))?;
    for work_ref in deploying {
        let op = work_ref
            .release_ref()
            .with_sub_path(SubPathType::Op, "check_envs");
        state.set(&op, "op", &serde_json::json!({ "environment": environment }))?;
        debug!(op = %op, "marked environment check");
    }
    Ok(outcome)
}

fn apply_deploy(intent: &RefStore, state: &RefStore, reference: &Ref) -> anyhow::Result<ApplyOutcome> {
    let declared = match intent.get_as::<DeployIntent>(reference) {
        Ok(declared) => declared,
        Err(err) if is_not_found(&err) => return remove_deploy(state, reference),
        Err(err) => return Err(err),
    };
    let environment = reference
        .name()
        .ok_or_else(|| anyhow::anyhow!("Deploy intent {} has no environment", reference))?;
    let env_ref = reference
        .release_ref()
        .with_sub_path(SubPathType::Environment, environment);
    if !intent.exists(&env_ref)? {
        anyhow::bail!(
            "Deploy intent {} names undeclared environment '{}'",
            reference,
            environment
        );
    }

    let release = resolve_release(state, &declared.release.relative_to(reference))
        .with_context(|| format!("Release {} of {} is unknown", declared.release, reference))?;
    let work_ref = deployment_ref(&release, reference);
    let deployment: Deployment = state
        .get_as(&work_ref)
        .with_context(|| format!("Release {} does not deploy to '{}'", release, environment))?;
    let inputs = overlay(&deployment.inputs, &declared.inputs);

    for number in run_numbers(state, &work_ref)?.into_iter().rev() {
        let run_ref = work_ref.join_sub_path(&number.to_string());
        if !state.status(&run_ref)?.is_some_and(|status| status.is_outstanding()) {
            continue;
        }
        let run = load_run(state, &run_ref)?;
        if run.run_type == RunType::Up && run.entry().map(|entry| &entry.inputs) == Some(&inputs) {
            let record = DeployRecord {
                release: release.clone(),
                run: run_ref.clone(),
            };
            let current = match state.get_as::<DeployRecord>(reference) {
                Ok(current) => Some(current),
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err),
            };
            if current.as_ref() != Some(&record) {
                state.set(reference, "deploy", &record)?;
            }
            debug!(run = %run_ref, "equivalent run already queued");
            return Ok(ApplyOutcome::AlreadyQueued(run_ref));
        }
    }

    let tx = state.start_transaction();
    let run = Run::new(
        RunType::Up,
        release.clone(),
        Function::new(deployment.up.clone(), inputs),
    );
    let run_ref = create_run(&tx, &work_ref, &run)?;
    tx.set(
        reference,
        "deploy",
        &DeployRecord {
            release,
            run: run_ref.clone(),
        },
    )?;
    tx.commit(&format!("Deploy {} via {}", reference, run_ref))?;
    info!(reference = %reference, run = %run_ref, "queued deploy run");
    Ok(ApplyOutcome::RunQueued(run_ref))
}

/// Intent no longer declares the deployment: queue its teardown when one exists
/// and drop the State record.
fn remove_deploy(state: &RefStore, reference: &Ref) -> anyhow::Result<ApplyOutcome> {
    let record = match state.get_as::<DeployRecord>(reference) {
        Ok(record) => record,
        Err(err) if is_not_found(&err) => return Ok(ApplyOutcome::Unchanged),
        Err(err) => return Err(err),
    };
    let work_ref = record
        .run
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Deploy record {} names no run", reference))?;
    let deployment: Deployment = state.get_as(&work_ref)?;

    let tx = state.start_transaction();
    let mut queued = None;
    if let Some(down) = deployment.down {
        let inputs = match load_run(&tx, &record.run) {
            Ok(run) => run.entry().map(|entry| entry.inputs.clone()),
            Err(err) if is_not_found(&err) => None,
            Err(err) => return Err(err),
        }
        .unwrap_or_else(|| deployment.inputs.clone());
        let run = Run::new(RunType::Down, record.release.clone(), Function::new(down, inputs));
        queued = Some(create_run(&tx, &work_ref, &run)?);
    }
    tx.delete(reference)?;
    let latest = work_ref.make_release("");
    tx.unlink(&latest)?;
    tx.commit(&format!("Remove deployment {}", reference))?;
    info!(reference = %reference, teardown = ?queued, "removed deployment");

    Ok(match queued {
        Some(run_ref) => ApplyOutcome::RunQueued(run_ref),
        None => ApplyOutcome::Deleted,
    })
}

/// Diff, then apply every change; failures are collected, not fatal.
pub fn sync(intent: &RefStore, state: &RefStore, scope: &str) -> anyhow::Result<SyncReport> {
    let mut report = SyncReport::default();
    for entry in diff(intent, state, scope)? {
        match apply_intent(intent, state, &entry.reference) {
            Ok(outcome) => report.applied.push((entry.reference, outcome)),
            Err(err) => {
                warn!(reference = %entry.reference, change = %entry.change, error = %format!("{:#}", err), "failed to apply intent");
                report.failed.push((entry.reference, format!("{:#}", err)));
            }
        }
    }
    info!(scope, applied = report.applied.len(), failed = report.failed.len(), "sync");
    Ok(report)
}

/// Read the State deploy record for `reference`.
pub fn deploy_record(state: &impl RefAccess, reference: &Ref) -> anyhow::Result<DeployRecord> {
    if reference.sub_path_type != SubPathType::Deploy {
        return Err(not_found(reference.to_string()));
    }
    state.get_as(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::InputDescriptor;
    use serde_json::json;

    fn r(s: &str) -> Ref {
        Ref::parse(s).expect("ref should parse")
    }

    #[test]
    fn overlay_and_overrides_are_inverse() {
        let mut base = Inputs::new();
        base.insert("a".to_string(), InputDescriptor::literal(json!(1)));
        base.insert("b".to_string(), InputDescriptor::literal(json!(2)));
        let mut layer = Inputs::new();
        layer.insert("b".to_string(), InputDescriptor::literal(json!(3)));

        let merged = overlay(&base, &layer);
        assert_eq!(merged["a"], InputDescriptor::literal(json!(1)));
        assert_eq!(merged["b"], InputDescriptor::literal(json!(3)));
        assert_eq!(overrides(&base, &merged), layer);
    }

    #[test]
    fn environment_changes_sort_around_the_rest() {
        let intent = RefStore::in_memory();
        let state = RefStore::in_memory();
        intent
            .set(&r("repo/-/pkg/+/environment/prod"), "environment", &json!({}))
            .expect("set should succeed");
        intent
            .set(&r("repo/-/pkg/+/custom/x"), "custom", &json!("a"))
            .expect("set should succeed");
        state
            .set(&r("repo/-/pkg/+/environment/old"), "environment", &json!({}))
            .expect("set should succeed");

        let entries = diff(&intent, &state, "**").expect("diff should succeed");
        let order: Vec<(String, ChangeKind)> = entries
            .iter()
            .map(|entry| (entry.reference.to_string(), entry.change))
            .collect();
        assert_eq!(
            order,
            vec![
                ("repo/-/pkg/+/environment/prod".to_string(), ChangeKind::Create),
                ("repo/-/pkg/+/custom/x".to_string(), ChangeKind::Create),
                ("repo/-/pkg/+/environment/old".to_string(), ChangeKind::Delete),
            ]
        );
    }

    #[test]
    fn deploy_intent_requires_declared_environment() {
        let intent = RefStore::in_memory();
        let state = RefStore::in_memory();
        let reference = r("repo/-/pkg/+/deploy/prod");
        intent
            .set(
                &reference,
                "deploy",
                &DeployIntent {
                    release: r("repo/-/pkg/@abc"),
                    inputs: Inputs::new(),
                },
            )
            .expect("set should succeed");
        let err = apply_intent(&intent, &state, &reference).expect_err("apply should fail");
        assert!(format!("{:#}", err).contains("undeclared environment"));

        // sync records the failure and carries on.
        let report = sync(&intent, &state, "**").expect("sync should succeed");
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn non_intent_refs_are_rejected() {
        let intent = RefStore::in_memory();
        let state = RefStore::in_memory();
        assert!(apply_intent(&intent, &state, &r("repo/-/pkg/@abc/custom/x")).is_err());
    }
}
